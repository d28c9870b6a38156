//! Durable fleet state: repositories, their agents, and the active-repository pointer.
//!
//! Every public operation on [`StateStore`] is individually atomic. Bulk work
//! (reconciliation, routing, nudging) runs against [`StateStore::snapshot`] so no
//! lock is ever held across terminal or filesystem I/O.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Completed-task records kept per repository; the oldest are dropped first.
pub const MAX_TASK_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    Supervisor,
    Worker,
    MergeQueue,
    Workspace,
}

impl AgentType {
    /// Persistent agents are restarted when their process dies; transient ones never are.
    pub fn is_persistent(self) -> bool {
        matches!(self, AgentType::Supervisor | AgentType::Workspace)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Supervisor => "supervisor",
            AgentType::Worker => "worker",
            AgentType::MergeQueue => "merge-queue",
            AgentType::Workspace => "workspace",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "supervisor" => Ok(AgentType::Supervisor),
            "worker" => Ok(AgentType::Worker),
            "merge-queue" | "merge_queue" => Ok(AgentType::MergeQueue),
            "workspace" => Ok(AgentType::Workspace),
            other => Err(format!("invalid agent type '{other}'")),
        }
    }
}

/// Which pull requests the merge-queue agent watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackMode {
    #[default]
    All,
    Author,
    Assignee,
}

impl TrackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackMode::All => "all",
            TrackMode::Author => "author",
            TrackMode::Assignee => "assignee",
        }
    }
}

impl FromStr for TrackMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "all" => Ok(TrackMode::All),
            "author" => Ok(TrackMode::Author),
            "assignee" => Ok(TrackMode::Assignee),
            other => Err(format!(
                "invalid track mode '{other}' (expected all, author, or assignee)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeQueueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub track_mode: TrackMode,
}

fn default_true() -> bool {
    true
}

impl Default for MergeQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_mode: TrackMode::All,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub worktree_path: String,
    pub tmux_window: String,
    #[serde(default)]
    pub session_id: String,
    /// Process id of the managed agent; 0 when unknown.
    #[serde(default)]
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_nudge: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ready_for_cleanup: bool,
    /// Bumped on every lifecycle mutation; used for compare-and-swap writes.
    #[serde(default)]
    pub version: u64,
}

impl Agent {
    pub fn new(
        agent_type: AgentType,
        worktree_path: impl Into<String>,
        tmux_window: impl Into<String>,
    ) -> Self {
        Self {
            agent_type,
            worktree_path: worktree_path.into(),
            tmux_window: tmux_window.into(),
            session_id: new_session_id(),
            pid: 0,
            task: None,
            created_at: Utc::now(),
            last_nudge: None,
            ready_for_cleanup: false,
            version: 0,
        }
    }
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub github_url: String,
    pub tmux_session: String,
    #[serde(default)]
    pub agents: HashMap<String, Agent>,
    #[serde(default)]
    pub merge_queue: MergeQueueConfig,
    #[serde(default)]
    pub task_history: Vec<TaskRecord>,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        github_url: impl Into<String>,
        tmux_session: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            github_url: github_url.into(),
            tmux_session: tmux_session.into(),
            agents: HashMap::new(),
            merge_queue: MergeQueueConfig::default(),
            task_history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub repos: BTreeMap<String, Repository>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_repo: Option<String>,
}

impl State {
    pub fn agent_count(&self) -> usize {
        self.repos.values().map(|r| r.agents.len()).sum()
    }

    fn repo_mut(&mut self, name: &str) -> Result<&mut Repository, StoreError> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| StoreError::RepoNotFound(name.to_string()))
    }

    fn agent_mut(&mut self, repo: &str, agent: &str) -> Result<&mut Agent, StoreError> {
        self.repo_mut(repo)?
            .agents
            .get_mut(agent)
            .ok_or_else(|| StoreError::AgentNotFound {
                repo: repo.to_string(),
                agent: agent.to_string(),
            })
    }
}

/// Concurrency-safe owner of all repository and agent records.
pub struct StateStore {
    path: Option<PathBuf>,
    state: RwLock<State>,
    save_lock: Mutex<()>,
}

impl StateStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_state(None, State::default())
    }

    /// Load from `path`; a missing file yields an empty store bound to that path.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let state = match std::fs::read_to_string(path) {
            Ok(body) => serde_json::from_str::<State>(&body)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(StoreError::Io(e)),
        };
        Ok(Self::with_state(Some(path.to_path_buf()), state))
    }

    fn with_state(path: Option<PathBuf>, state: State) -> Self {
        Self {
            path,
            state: RwLock::new(state),
            save_lock: Mutex::new(()),
        }
    }

    /// Write the current state atomically (temp file + rename).
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();
        let body = serde_json::to_vec_pretty(&*self.state.read())?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &body)?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let out = {
            let mut state = self.state.write();
            f(&mut state)?
        };
        if let Err(error) = self.save() {
            tracing::warn!(target = "fleetd::state", error = %error, "failed persisting state");
        }
        Ok(out)
    }

    /// Point-in-time copy of everything.
    pub fn snapshot(&self) -> State {
        self.state.read().clone()
    }

    /// (repository count, agent count)
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.repos.len(), state.agent_count())
    }

    pub fn list_repos(&self) -> Vec<Repository> {
        self.state.read().repos.values().cloned().collect()
    }

    pub fn get_repo(&self, name: &str) -> Result<Repository, StoreError> {
        self.state
            .read()
            .repos
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::RepoNotFound(name.to_string()))
    }

    pub fn add_repo(&self, repo: Repository) -> Result<(), StoreError> {
        self.mutate(|state| {
            if state.repos.contains_key(&repo.name) {
                return Err(StoreError::RepoExists(repo.name));
            }
            state.repos.insert(repo.name.clone(), repo);
            Ok(())
        })
    }

    pub fn remove_repo(&self, name: &str) -> Result<Repository, StoreError> {
        self.mutate(|state| {
            let repo = state
                .repos
                .remove(name)
                .ok_or_else(|| StoreError::RepoNotFound(name.to_string()))?;
            if state.current_repo.as_deref() == Some(name) {
                state.current_repo = None;
            }
            Ok(repo)
        })
    }

    pub fn add_agent(&self, repo: &str, name: &str, agent: Agent) -> Result<(), StoreError> {
        self.mutate(|state| {
            let r = state.repo_mut(repo)?;
            if r.agents.contains_key(name) {
                return Err(StoreError::AgentExists {
                    repo: repo.to_string(),
                    agent: name.to_string(),
                });
            }
            r.agents.insert(name.to_string(), agent);
            Ok(())
        })
    }

    pub fn get_agent(&self, repo: &str, name: &str) -> Result<Agent, StoreError> {
        let state = self.state.read();
        let r = state
            .repos
            .get(repo)
            .ok_or_else(|| StoreError::RepoNotFound(repo.to_string()))?;
        r.agents
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::AgentNotFound {
                repo: repo.to_string(),
                agent: name.to_string(),
            })
    }

    /// Agents of a repository, sorted by name.
    pub fn list_agents(&self, repo: &str) -> Result<Vec<(String, Agent)>, StoreError> {
        let r = self.get_repo(repo)?;
        let mut agents: Vec<(String, Agent)> = r.agents.into_iter().collect();
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(agents)
    }

    pub fn remove_agent(&self, repo: &str, name: &str) -> Result<Agent, StoreError> {
        self.mutate(|state| {
            state
                .repo_mut(repo)?
                .agents
                .remove(name)
                .ok_or_else(|| StoreError::AgentNotFound {
                    repo: repo.to_string(),
                    agent: name.to_string(),
                })
        })
    }

    /// Remove an agent only if it is still at `expected_version`. An agent
    /// marked ready-for-cleanup is removed whatever its version.
    pub fn remove_agent_if(
        &self,
        repo: &str,
        name: &str,
        expected_version: u64,
    ) -> Result<Agent, StoreError> {
        self.mutate(|state| {
            let agent = state.agent_mut(repo, name)?;
            if agent.version != expected_version && !agent.ready_for_cleanup {
                return Err(StoreError::StaleWrite {
                    agent: name.to_string(),
                    expected: expected_version,
                    found: agent.version,
                });
            }
            state
                .repo_mut(repo)?
                .agents
                .remove(name)
                .ok_or_else(|| StoreError::AgentNotFound {
                    repo: repo.to_string(),
                    agent: name.to_string(),
                })
        })
    }

    /// Apply a lifecycle mutation, optionally guarded by the expected version,
    /// and bump the version. Returns the updated record.
    pub fn update_agent(
        &self,
        repo: &str,
        name: &str,
        expected_version: Option<u64>,
        f: impl FnOnce(&mut Agent),
    ) -> Result<Agent, StoreError> {
        self.mutate(|state| {
            let agent = state.agent_mut(repo, name)?;
            if let Some(expected) = expected_version {
                if agent.version != expected {
                    return Err(StoreError::StaleWrite {
                        agent: name.to_string(),
                        expected,
                        found: agent.version,
                    });
                }
            }
            f(agent);
            agent.version += 1;
            Ok(agent.clone())
        })
    }

    /// Record a successful nudge. Not a lifecycle change, so the version stays.
    pub fn record_nudge(&self, repo: &str, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.agent_mut(repo, name)?.last_nudge = Some(at);
            Ok(())
        })
    }

    /// Drop every agent of a repository, returning their names.
    pub fn clear_agents(&self, repo: &str) -> Result<Vec<String>, StoreError> {
        self.mutate(|state| {
            let r = state.repo_mut(repo)?;
            let mut names: Vec<String> = r.agents.drain().map(|(name, _)| name).collect();
            names.sort();
            Ok(names)
        })
    }

    pub fn merge_queue(&self, repo: &str) -> Result<MergeQueueConfig, StoreError> {
        Ok(self.get_repo(repo)?.merge_queue)
    }

    pub fn update_merge_queue(
        &self,
        repo: &str,
        f: impl FnOnce(&mut MergeQueueConfig),
    ) -> Result<MergeQueueConfig, StoreError> {
        self.mutate(|state| {
            let r = state.repo_mut(repo)?;
            f(&mut r.merge_queue);
            Ok(r.merge_queue.clone())
        })
    }

    pub fn record_task(&self, repo: &str, record: TaskRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            let history = &mut state.repo_mut(repo)?.task_history;
            history.push(record);
            if history.len() > MAX_TASK_HISTORY {
                let excess = history.len() - MAX_TASK_HISTORY;
                history.drain(..excess);
            }
            Ok(())
        })
    }

    /// Most recent first, at most `limit` entries.
    pub fn task_history(&self, repo: &str, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let r = self.get_repo(repo)?;
        Ok(r.task_history.into_iter().rev().take(limit).collect())
    }

    pub fn current_repo(&self) -> Option<String> {
        self.state.read().current_repo.clone()
    }

    pub fn set_current_repo(&self, name: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            if !state.repos.contains_key(name) {
                return Err(StoreError::RepoNotFound(name.to_string()));
            }
            state.current_repo = Some(name.to_string());
            Ok(())
        })
    }

    pub fn clear_current_repo(&self) {
        let _ = self.mutate(|state| {
            state.current_repo = None;
            Ok(())
        });
    }
}
