//! Starts managed agent processes inside terminal windows.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::DaemonPaths;
use crate::state::{new_session_id, Agent, AgentType};
use crate::terminal::Terminal;

#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub repo: &'a str,
    pub session: &'a str,
    pub name: &'a str,
    pub agent_type: AgentType,
    pub workdir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub window: String,
    pub pid: u32,
    pub session_id: String,
}

#[derive(Clone)]
pub struct Launcher {
    terminal: Arc<dyn Terminal>,
    argv: Vec<String>,
    paths: DaemonPaths,
}

pub fn agent_env(repo: &str, name: &str, agent_type: AgentType) -> Vec<(String, String)> {
    vec![
        ("FLEETD_REPO".to_string(), repo.to_string()),
        ("FLEETD_AGENT".to_string(), name.to_string()),
        ("FLEETD_AGENT_TYPE".to_string(), agent_type.as_str().to_string()),
    ]
}

impl Launcher {
    pub fn new(terminal: Arc<dyn Terminal>, argv: Vec<String>, paths: DaemonPaths) -> Self {
        Self {
            terminal,
            argv,
            paths,
        }
    }

    /// Fresh sessions get `--session-id`, restarts `--resume`.
    pub fn command_for(&self, session_id: &str, resume: bool) -> Vec<String> {
        let mut argv = self.argv.clone();
        argv.push(if resume { "--resume" } else { "--session-id" }.to_string());
        argv.push(session_id.to_string());
        argv
    }

    /// Open a new window named after the agent and start it there.
    pub fn launch(&self, spec: &LaunchSpec<'_>) -> Result<Launched> {
        let session_id = new_session_id();
        let argv = self.command_for(&session_id, false);
        let env = agent_env(spec.repo, spec.name, spec.agent_type);
        let pid = self
            .terminal
            .new_window(spec.session, spec.name, spec.workdir, &argv, &env)
            .with_context(|| format!("failed to launch {} '{}'", spec.agent_type, spec.name))?;
        self.capture_output(spec.repo, spec.session, spec.name);
        tracing::info!(target = "fleetd::launcher", repo = %spec.repo, agent = %spec.name, pid, "launched agent");
        Ok(Launched {
            window: spec.name.to_string(),
            pid,
            session_id,
        })
    }

    /// Relaunch an existing agent in place, keeping its session id when it has one.
    pub fn restart(&self, repo: &str, session: &str, name: &str, agent: &Agent) -> Result<Launched> {
        let (session_id, resume) = if agent.session_id.is_empty() {
            (new_session_id(), false)
        } else {
            (agent.session_id.clone(), true)
        };
        let argv = self.command_for(&session_id, resume);
        let env = agent_env(repo, name, agent.agent_type);
        let workdir = self.workdir_for(repo, agent);
        let window = if agent.tmux_window.is_empty() {
            name.to_string()
        } else {
            agent.tmux_window.clone()
        };

        let pid = if self.terminal.has_window(session, &window)? {
            self.terminal
                .respawn_window(session, &window, &workdir, &argv, &env)
        } else {
            self.terminal
                .new_window(session, &window, &workdir, &argv, &env)
        }
        .with_context(|| format!("failed to restart agent '{name}'"))?;

        self.capture_output(repo, session, &window);
        tracing::info!(target = "fleetd::launcher", repo = %repo, agent = %name, pid, resume, "restarted agent");
        Ok(Launched {
            window,
            pid,
            session_id,
        })
    }

    fn workdir_for(&self, repo: &str, agent: &Agent) -> PathBuf {
        if agent.worktree_path.is_empty() {
            self.paths.repo_dir(repo)
        } else {
            PathBuf::from(&agent.worktree_path)
        }
    }

    fn capture_output(&self, repo: &str, session: &str, window: &str) {
        let log_path = self.paths.agent_log(repo, window);
        if let Some(dir) = log_path.parent() {
            if let Err(error) = std::fs::create_dir_all(dir) {
                tracing::warn!(target = "fleetd::launcher", path = %dir.display(), error = %error, "failed creating output dir");
                return;
            }
        }
        if let Err(error) = self.terminal.pipe_output(session, window, &log_path) {
            tracing::warn!(target = "fleetd::launcher", repo = %repo, window = %window, error = %error, "failed piping agent output");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTerminal;
    use tempfile::TempDir;

    fn launcher(term: Arc<FakeTerminal>, root: &Path) -> Launcher {
        Launcher::new(
            term,
            vec!["claude".to_string()],
            DaemonPaths::from_root(root),
        )
    }

    #[test]
    fn fresh_launch_uses_session_id_flag() {
        let dir = TempDir::new().unwrap();
        let term = Arc::new(FakeTerminal::default());
        term.add_session("mc-demo");
        let launcher = launcher(term.clone(), dir.path());

        let launched = launcher
            .launch(&LaunchSpec {
                repo: "demo",
                session: "mc-demo",
                name: "supervisor",
                agent_type: AgentType::Supervisor,
                workdir: dir.path(),
            })
            .unwrap();

        assert_eq!(launched.window, "supervisor");
        assert!(launched.pid > 0);
        let argv = term.last_argv("mc-demo", "supervisor").unwrap();
        assert_eq!(argv[..2], ["claude".to_string(), "--session-id".to_string()]);
        assert_eq!(argv[2], launched.session_id);
        assert!(dir.path().join("output").join("demo").exists());
    }

    #[test]
    fn restart_resumes_existing_session_in_same_window() {
        let dir = TempDir::new().unwrap();
        let term = Arc::new(FakeTerminal::default());
        term.add_window("mc-demo", "supervisor", 100);
        let launcher = launcher(term.clone(), dir.path());

        let mut agent = Agent::new(AgentType::Supervisor, "", "supervisor");
        agent.session_id = "sess-1".into();
        let launched = launcher
            .restart("demo", "mc-demo", "supervisor", &agent)
            .unwrap();

        assert_eq!(launched.session_id, "sess-1");
        assert_ne!(launched.pid, 100);
        let argv = term.last_argv("mc-demo", "supervisor").unwrap();
        assert_eq!(argv, vec!["claude", "--resume", "sess-1"]);
    }

    #[test]
    fn restart_without_session_id_generates_one() {
        let dir = TempDir::new().unwrap();
        let term = Arc::new(FakeTerminal::default());
        term.add_session("mc-demo");
        let launcher = launcher(term.clone(), dir.path());

        let mut agent = Agent::new(AgentType::Workspace, "", "workspace");
        agent.session_id.clear();
        let launched = launcher
            .restart("demo", "mc-demo", "workspace", &agent)
            .unwrap();
        assert!(!launched.session_id.is_empty());
        assert!(term.window_exists("mc-demo", "workspace"));
    }
}
