use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository '{0}' not found")]
    RepoNotFound(String),

    #[error("repository '{0}' already exists")]
    RepoExists(String),

    #[error("agent '{agent}' not found in repository '{repo}'")]
    AgentNotFound { repo: String, agent: String },

    #[error("agent '{agent}' already exists in repository '{repo}'")]
    AgentExists { repo: String, agent: String },

    /// A compare-and-swap lost against a concurrent lifecycle change.
    #[error("agent '{agent}' changed concurrently (expected version {expected}, found {found})")]
    StaleWrite {
        agent: String,
        expected: u64,
        found: u64,
    },

    #[error("state IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleWrite { .. })
    }
}

/// Errors raised while claiming or releasing the single-instance marker.
#[derive(Debug, Error)]
pub enum SingletonError {
    #[error("daemon already running (pid: {0})")]
    AlreadyRunning(u32),

    #[error("another daemon holds the lock at {0}")]
    Locked(PathBuf),

    #[error("invalid PID file contents: {0:?}")]
    InvalidPidFile(String),

    #[error("singleton IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::{SingletonError, StoreError};

    #[test]
    fn messages_name_the_entity() {
        let err = StoreError::AgentNotFound {
            repo: "demo".into(),
            agent: "w1".into(),
        };
        assert_eq!(
            err.to_string(),
            "agent 'w1' not found in repository 'demo'"
        );
        assert_eq!(
            StoreError::RepoExists("demo".into()).to_string(),
            "repository 'demo' already exists"
        );
    }

    #[test]
    fn stale_write_is_detectable() {
        let err = StoreError::StaleWrite {
            agent: "supervisor".into(),
            expected: 1,
            found: 2,
        };
        assert!(err.is_stale());
        assert!(!StoreError::RepoNotFound("x".into()).is_stale());
    }

    #[test]
    fn already_running_names_the_pid() {
        assert_eq!(
            SingletonError::AlreadyRunning(42).to_string(),
            "daemon already running (pid: 42)"
        );
    }
}
