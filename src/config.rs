use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Default cadence of the reconciliation, routing and wake loops.
pub const DEFAULT_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Parser)]
#[command(name = "fleetd")]
#[command(about = "Supervises terminal-hosted coding agents across repositories")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground.
    Run(DaemonConfig),
    /// Send one request to a running daemon and print the response.
    Rpc(RpcCommand),
}

#[derive(Debug, Clone, clap::Args)]
pub struct DaemonConfig {
    /// State directory (default: $FLEETD_ROOT or ~/.fleetd)
    #[arg(long)]
    pub root: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Command line used to start a managed agent.
    #[arg(long, default_value = "claude")]
    pub agent_command: String,

    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub health_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub route_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub wake_interval_secs: u64,
}

#[derive(Debug, Clone, clap::Args)]
pub struct RpcCommand {
    pub command: String,

    /// JSON object of command arguments.
    #[arg(long, default_value = "{}")]
    pub args: String,

    #[arg(long)]
    pub root: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn intervals(&self) -> Intervals {
        Intervals {
            health: Duration::from_secs(self.health_interval_secs.max(1)),
            route: Duration::from_secs(self.route_interval_secs.max(1)),
            wake: Duration::from_secs(self.wake_interval_secs.max(1)),
        }
    }

    /// The agent command split into argv; falls back to whitespace splitting
    /// when the string is not valid shell syntax.
    pub fn agent_argv(&self) -> Vec<String> {
        shlex::split(&self.agent_command).unwrap_or_else(|| {
            self.agent_command
                .split_whitespace()
                .map(ToOwned::to_owned)
                .collect()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    pub health: Duration,
    pub route: Duration,
    pub wake: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        let every = Duration::from_secs(DEFAULT_INTERVAL_SECS);
        Self {
            health: every,
            route: every,
            wake: every,
        }
    }
}

/// `--root`, then `$FLEETD_ROOT`, then `~/.fleetd`.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(root) = explicit {
        return root.to_path_buf();
    }
    if let Ok(root) = std::env::var("FLEETD_ROOT") {
        if !root.trim().is_empty() {
            return PathBuf::from(root);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetd")
}

/// Filesystem layout of a daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub root: PathBuf,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub socket_file: PathBuf,
    pub state_file: PathBuf,
    pub log_file: PathBuf,
    pub repos_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub messages_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl DaemonPaths {
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            pid_file: root.join("daemon.pid"),
            lock_file: root.join("daemon.lock"),
            socket_file: root.join("daemon.sock"),
            state_file: root.join("state.json"),
            log_file: root.join("daemon.log"),
            repos_dir: root.join("repos"),
            worktrees_dir: root.join("wts"),
            messages_dir: root.join("messages"),
            output_dir: root.join("output"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.root,
            &self.repos_dir,
            &self.worktrees_dir,
            &self.messages_dir,
            &self.output_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// The repository's primary checkout.
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.repos_dir.join(repo)
    }

    /// Directory holding the repository's agent worktrees.
    pub fn worktree_root(&self, repo: &str) -> PathBuf {
        self.worktrees_dir.join(repo)
    }

    pub fn agent_log(&self, repo: &str, agent: &str) -> PathBuf {
        self.output_dir.join(repo).join(format!("{agent}.log"))
    }
}
