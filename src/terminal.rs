//! Terminal-multiplexer driver.
//!
//! Every call shells out and blocks; callers run them on the blocking pool and
//! never while holding the state lock.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{bail, Context, Result};

pub trait Terminal: Send + Sync {
    fn has_session(&self, session: &str) -> Result<bool>;
    fn create_session(&self, session: &str, workdir: &Path) -> Result<()>;
    fn has_window(&self, session: &str, window: &str) -> Result<bool>;
    fn kill_window(&self, session: &str, window: &str) -> Result<()>;
    /// Type `text` literally into the window, without submitting it.
    fn send_text(&self, session: &str, window: &str, text: &str) -> Result<()>;
    fn send_enter(&self, session: &str, window: &str) -> Result<()>;
    fn pane_pid(&self, session: &str, window: &str) -> Result<u32>;
    /// Open a detached window running `argv`; returns the pane process id.
    fn new_window(
        &self,
        session: &str,
        window: &str,
        workdir: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<u32>;
    /// Replace whatever runs in an existing window with `argv`; returns the new pane pid.
    fn respawn_window(
        &self,
        session: &str,
        window: &str,
        workdir: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<u32>;
    /// Append everything the window prints to `log_path`.
    fn pipe_output(&self, session: &str, window: &str, log_path: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TmuxDriver {
    binary: String,
    socket: Option<PathBuf>,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            socket: None,
        }
    }

    /// Talk to the server behind `socket` instead of the user's default one.
    pub fn with_socket(mut self, socket: impl Into<PathBuf>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.binary);
        if let Some(socket) = &self.socket {
            cmd.arg("-S").arg(socket);
        }
        cmd.args(args)
            .output()
            .with_context(|| format!("failed to run {} {}", self.binary, args.join(" ")))
    }

    fn run_ok(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            bail!(
                "{} {} failed: {}",
                self.binary,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

/// Exact-name target. A bare name would fall back to prefix matching, so
/// `w1` could resolve to `w10` once `w1` is gone.
fn target(session: &str, window: &str) -> String {
    format!("={session}:={window}")
}

fn env_flags(env: &[(String, String)]) -> Vec<String> {
    env.iter()
        .flat_map(|(k, v)| ["-e".to_string(), format!("{k}={v}")])
        .collect()
}

fn parse_pid(stdout: &[u8]) -> Result<u32> {
    let raw = String::from_utf8_lossy(stdout);
    raw.trim()
        .lines()
        .next()
        .unwrap_or_default()
        .parse::<u32>()
        .with_context(|| format!("unexpected pane pid output '{}'", raw.trim()))
}

impl Terminal for TmuxDriver {
    fn has_session(&self, session: &str) -> Result<bool> {
        let exact = format!("={session}");
        Ok(self.run(&["has-session", "-t", &exact])?.status.success())
    }

    fn create_session(&self, session: &str, workdir: &Path) -> Result<()> {
        let dir = workdir.to_string_lossy();
        self.run_ok(&["new-session", "-d", "-s", session, "-c", &dir])?;
        Ok(())
    }

    fn has_window(&self, session: &str, window: &str) -> Result<bool> {
        let exact = format!("={session}");
        let output = self.run(&["list-windows", "-t", &exact, "-F", "#{window_name}"])?;
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|name| name == window))
    }

    fn kill_window(&self, session: &str, window: &str) -> Result<()> {
        self.run_ok(&["kill-window", "-t", &target(session, window)])?;
        Ok(())
    }

    fn send_text(&self, session: &str, window: &str, text: &str) -> Result<()> {
        self.run_ok(&["send-keys", "-t", &target(session, window), "-l", text])?;
        Ok(())
    }

    fn send_enter(&self, session: &str, window: &str) -> Result<()> {
        self.run_ok(&["send-keys", "-t", &target(session, window), "Enter"])?;
        Ok(())
    }

    fn pane_pid(&self, session: &str, window: &str) -> Result<u32> {
        let output = self.run_ok(&[
            "display-message",
            "-p",
            "-t",
            &target(session, window),
            "#{pane_pid}",
        ])?;
        parse_pid(&output.stdout)
    }

    fn new_window(
        &self,
        session: &str,
        window: &str,
        workdir: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<u32> {
        let session_target = format!("={session}:");
        let dir = workdir.to_string_lossy().into_owned();
        let mut args: Vec<String> = [
            "new-window",
            "-d",
            "-P",
            "-F",
            "#{pane_pid}",
            "-t",
            session_target.as_str(),
            "-n",
            window,
            "-c",
            dir.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend(env_flags(env));
        args.extend(argv.iter().cloned());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_ok(&refs)?;
        parse_pid(&output.stdout)
    }

    fn respawn_window(
        &self,
        session: &str,
        window: &str,
        workdir: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<u32> {
        let pane = target(session, window);
        let dir = workdir.to_string_lossy().into_owned();
        let mut args: Vec<String> = ["respawn-pane", "-k", "-t", pane.as_str(), "-c", dir.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(env_flags(env));
        args.extend(argv.iter().cloned());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_ok(&refs)?;
        self.pane_pid(session, window)
    }

    fn pipe_output(&self, session: &str, window: &str, log_path: &Path) -> Result<()> {
        let quoted = shlex::try_quote(&log_path.to_string_lossy())
            .map(|q| q.into_owned())
            .context("log path cannot be shell-quoted")?;
        let sink = format!("cat >> {quoted}");
        self.run_ok(&["pipe-pane", "-o", "-t", &target(session, window), &sink])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{env_flags, parse_pid, target, Terminal, TmuxDriver};
    use std::process::Command;
    use tempfile::TempDir;

    #[test]
    fn target_matches_session_and_window_exactly() {
        assert_eq!(target("mc-demo", "w1"), "=mc-demo:=w1");
    }

    /// Private tmux server that is torn down with the test.
    struct Server {
        driver: TmuxDriver,
        dir: TempDir,
    }

    impl Server {
        fn start() -> Option<Self> {
            let available = Command::new("tmux")
                .arg("-V")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !available {
                return None;
            }
            let dir = TempDir::new().unwrap();
            let driver = TmuxDriver::default().with_socket(dir.path().join("tmux.sock"));
            Some(Self { driver, dir })
        }
    }

    impl Drop for Server {
        fn drop(&mut self) {
            let _ = self.driver.run(&["kill-server"]);
        }
    }

    #[test]
    fn window_calls_never_fall_back_to_a_prefix_match() {
        let Some(server) = Server::start() else {
            eprintln!("tmux not installed; skipping");
            return;
        };
        let tmux = &server.driver;
        let workdir = server.dir.path();
        tmux.create_session("mc-demo", workdir).unwrap();
        tmux.new_window("mc-demo", "w10", workdir, &["sleep".into(), "300".into()], &[])
            .unwrap();

        assert!(!tmux.has_window("mc-demo", "w1").unwrap());
        assert!(tmux.send_text("mc-demo", "w1", "hello").is_err());
        assert!(tmux.send_enter("mc-demo", "w1").is_err());
        assert!(tmux.pane_pid("mc-demo", "w1").is_err());
        assert!(tmux.kill_window("mc-demo", "w1").is_err());
        assert!(tmux.has_window("mc-demo", "w10").unwrap());

        tmux.kill_window("mc-demo", "w10").unwrap();
        assert!(!tmux.has_window("mc-demo", "w10").unwrap());
    }

    #[test]
    fn session_lookup_is_exact() {
        let Some(server) = Server::start() else {
            eprintln!("tmux not installed; skipping");
            return;
        };
        let tmux = &server.driver;
        tmux.create_session("mc-demo-2", server.dir.path()).unwrap();

        assert!(!tmux.has_session("mc-demo").unwrap());
        assert!(tmux.has_session("mc-demo-2").unwrap());
        assert!(tmux
            .new_window("mc-demo", "w1", server.dir.path(), &["sleep".into(), "300".into()], &[])
            .is_err());
    }

    #[test]
    fn env_flags_are_paired() {
        let flags = env_flags(&[("A".into(), "1".into()), ("B".into(), "x y".into())]);
        assert_eq!(flags, vec!["-e", "A=1", "-e", "B=x y"]);
    }

    #[test]
    fn parses_pane_pid_output() {
        assert_eq!(parse_pid(b"4242\n").unwrap(), 4242);
        assert!(parse_pid(b"not-a-pid").is_err());
    }

    #[test]
    fn missing_binary_surfaces_as_error() {
        let driver = TmuxDriver::new("/nonexistent/tmux-binary");
        assert!(driver.has_session("anything").is_err());
    }
}
