//! Reconciliation engine.
//!
//! Each pass compares recorded state with what the terminal and the
//! filesystem actually show, restarts persistent agents whose process died,
//! restores whole repositories whose session vanished, and removes agents that
//! finished or lost their window. Every collaborator failure is logged and the
//! affected unit skipped; a pass never fails as a whole.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DaemonPaths;
use crate::error::StoreError;
use crate::launcher::{LaunchSpec, Launcher};
use crate::state::{Agent, AgentType, Repository, StateStore};
use crate::Backends;

const WORKSPACE_AGENT: &str = "workspace";
const SUPERVISOR_AGENT: &str = "supervisor";
const WORKSPACE_BRANCH: &str = "workspace/default";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub removed: usize,
    pub restarted: usize,
    pub restored_repos: usize,
    pub cleared_repos: usize,
    pub orphans_removed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub agents_removed: usize,
    pub issues_fixed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupReason {
    Completed,
    WindowGone,
    WorktreeGone,
}

impl CleanupReason {
    fn as_str(self) -> &'static str {
        match self {
            CleanupReason::Completed => "completed",
            CleanupReason::WindowGone => "window gone",
            CleanupReason::WorktreeGone => "worktree gone",
        }
    }
}

#[derive(Debug)]
struct Doomed {
    name: String,
    agent: Agent,
    reason: CleanupReason,
}

#[derive(Debug, Default)]
struct CleanupOutcome {
    removed: usize,
    messages_purged: usize,
}

pub struct Reconciler {
    store: Arc<StateStore>,
    backends: Backends,
    launcher: Launcher,
    paths: DaemonPaths,
}

impl Reconciler {
    pub fn new(
        store: Arc<StateStore>,
        backends: Backends,
        launcher: Launcher,
        paths: DaemonPaths,
    ) -> Self {
        Self {
            store,
            backends,
            launcher,
            paths,
        }
    }

    /// One full reconciliation pass over every repository, then the orphan sweep.
    pub fn health_check(&self) -> PassReport {
        let snapshot = self.store.snapshot();
        let mut report = PassReport::default();

        for repo in snapshot.repos.values() {
            self.check_repo(repo, &mut report);
        }
        report.orphans_removed = self.sweep_orphans();

        if report != PassReport::default() {
            info!(target = "fleetd::reconcile", ?report, "health check changed state");
        } else {
            debug!(target = "fleetd::reconcile", "health check found nothing to do");
        }
        report
    }

    fn check_repo(&self, repo: &Repository, report: &mut PassReport) {
        let terminal = &self.backends.terminal;
        match terminal.has_session(&repo.tmux_session) {
            Ok(true) => {}
            Ok(false) => {
                warn!(target = "fleetd::reconcile", repo = %repo.name, session = %repo.tmux_session, "terminal session missing");
                if self.restore_repo(repo) {
                    report.restored_repos += 1;
                } else {
                    self.clear_repo(&repo.name);
                    report.cleared_repos += 1;
                }
                return;
            }
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo.name, error = %error, "failed checking session; skipping repository");
                return;
            }
        }

        let mut doomed = Vec::new();
        for (name, agent) in sorted_agents(repo) {
            if agent.ready_for_cleanup {
                doomed.push(Doomed {
                    name: name.clone(),
                    agent: agent.clone(),
                    reason: CleanupReason::Completed,
                });
                continue;
            }

            match terminal.has_window(&repo.tmux_session, &agent.tmux_window) {
                Ok(true) => {}
                Ok(false) => {
                    doomed.push(Doomed {
                        name: name.clone(),
                        agent: agent.clone(),
                        reason: CleanupReason::WindowGone,
                    });
                    continue;
                }
                Err(error) => {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, error = %error, "failed checking window");
                    continue;
                }
            }

            if agent.pid == 0 || self.backends.probe.is_alive(agent.pid) {
                continue;
            }

            if agent.agent_type.is_persistent() {
                if self.restart_in_place(repo, name, agent) {
                    report.restarted += 1;
                }
            } else {
                // The user may still be using the window; leave it alone.
                debug!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, pid = agent.pid, "transient agent process is gone, window kept");
            }
        }

        report.removed += self.cleanup(repo, doomed).removed;
    }

    fn restart_in_place(&self, repo: &Repository, name: &str, agent: &Agent) -> bool {
        info!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, pid = agent.pid, "persistent agent process died; restarting");
        let launched = match self
            .launcher
            .restart(&repo.name, &repo.tmux_session, name, agent)
        {
            Ok(launched) => launched,
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, error = %error, "restart failed");
                return false;
            }
        };

        let record = |expected: u64| {
            self.store
                .update_agent(&repo.name, name, Some(expected), |a| {
                    a.pid = launched.pid;
                    a.tmux_window = launched.window.clone();
                    a.session_id = launched.session_id.clone();
                })
        };
        match record(agent.version) {
            Ok(_) => return true,
            Err(StoreError::StaleWrite { .. } | StoreError::AgentNotFound { .. }) => {}
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, error = %error, "failed recording restarted agent");
                return false;
            }
        }

        // The record moved while the pane was respawning; the pane now runs our process.
        match self.store.get_agent(&repo.name, name) {
            Ok(current) if current.ready_for_cleanup => {
                info!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, "agent completed during restart; window left for cleanup");
                false
            }
            Ok(current) => match record(current.version) {
                Ok(_) => {
                    info!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, pid = launched.pid, "record changed during restart; recorded relaunched pane");
                    true
                }
                Err(error) => {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, error = %error, "could not record relaunched pane; stale pid kept, next pass restarts again");
                    false
                }
            },
            Err(_) => {
                info!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, "agent removed during restart; killing relaunched window");
                if let Err(error) = self
                    .backends
                    .terminal
                    .kill_window(&repo.tmux_session, &launched.window)
                {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %name, error = %error, "failed killing relaunched window");
                }
                false
            }
        }
    }

    /// Kill, forget, and tidy up after each doomed agent. Window-kill and
    /// worktree failures never keep a record alive.
    fn cleanup(&self, repo: &Repository, doomed: Vec<Doomed>) -> CleanupOutcome {
        let mut outcome = CleanupOutcome::default();
        if doomed.is_empty() {
            return outcome;
        }
        let repo_dir = self.paths.repo_dir(&repo.name);

        for d in doomed {
            match self.store.get_agent(&repo.name, &d.name) {
                Ok(current) if current.version != d.agent.version && !current.ready_for_cleanup => {
                    info!(target = "fleetd::reconcile", repo = %repo.name, agent = %d.name, "agent changed since snapshot; not cleaning up");
                    continue;
                }
                Ok(_) => {}
                Err(_) => continue,
            }

            info!(target = "fleetd::reconcile", repo = %repo.name, agent = %d.name, reason = d.reason.as_str(), "cleaning up agent");
            if d.reason != CleanupReason::WindowGone {
                if let Err(error) = self
                    .backends
                    .terminal
                    .kill_window(&repo.tmux_session, &d.agent.tmux_window)
                {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %d.name, error = %error, "failed killing window");
                }
            }

            match self.store.remove_agent_if(&repo.name, &d.name, d.agent.version) {
                Ok(_) => outcome.removed += 1,
                Err(StoreError::AgentNotFound { .. }) => continue,
                Err(error) => {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %d.name, error = %error, "failed removing agent record");
                    continue;
                }
            }

            if d.agent.agent_type == AgentType::Worker && !d.agent.worktree_path.is_empty() {
                let path = Path::new(&d.agent.worktree_path);
                if let Err(error) = self.backends.worktrees.remove(&repo_dir, path, true) {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, agent = %d.name, path = %path.display(), error = %error, "failed removing worktree");
                }
            }
        }

        outcome.messages_purged = self.purge_messages(&repo.name);
        outcome
    }

    fn purge_messages(&self, repo: &str) -> usize {
        let live: Vec<String> = match self.store.list_agents(repo) {
            Ok(agents) => agents.into_iter().map(|(name, _)| name).collect(),
            Err(_) => Vec::new(),
        };
        match self.backends.messages.cleanup_orphaned(repo, &live) {
            Ok(n) => n,
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo, error = %error, "failed cleaning orphaned messages");
                0
            }
        }
    }

    /// Recreate a vanished session and its persistent agents, if the checkout
    /// is still there. Returns false when the caller should fall back to clearing.
    fn restore_repo(&self, repo: &Repository) -> bool {
        let repo_dir = self.paths.repo_dir(&repo.name);
        if !repo_dir.is_dir() || !self.backends.worktrees.is_repository(&repo_dir) {
            warn!(target = "fleetd::reconcile", repo = %repo.name, path = %repo_dir.display(), "repository checkout missing; cannot restore");
            return false;
        }

        match self.try_restore(repo, &repo_dir) {
            Ok(()) => {
                info!(target = "fleetd::reconcile", repo = %repo.name, "restored repository session");
                true
            }
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo.name, error = %error, "restore failed");
                false
            }
        }
    }

    fn try_restore(&self, repo: &Repository, repo_dir: &Path) -> Result<()> {
        self.backends
            .terminal
            .create_session(&repo.tmux_session, repo_dir)?;

        let discarded = self.store.clear_agents(&repo.name)?;
        if !discarded.is_empty() {
            info!(target = "fleetd::reconcile", repo = %repo.name, agents = ?discarded, "discarded stale agents");
        }

        self.spawn_persistent(repo, AgentType::Supervisor, SUPERVISOR_AGENT, repo_dir)?;

        let workspace = self.paths.worktree_root(&repo.name).join(WORKSPACE_AGENT);
        if !workspace.exists() {
            self.backends
                .worktrees
                .create(repo_dir, &workspace, WORKSPACE_BRANCH)?;
        }
        self.spawn_persistent(repo, AgentType::Workspace, WORKSPACE_AGENT, &workspace)?;

        self.purge_messages(&repo.name);
        Ok(())
    }

    fn spawn_persistent(
        &self,
        repo: &Repository,
        agent_type: AgentType,
        name: &str,
        workdir: &Path,
    ) -> Result<()> {
        let launched = self.launcher.launch(&LaunchSpec {
            repo: &repo.name,
            session: &repo.tmux_session,
            name,
            agent_type,
            workdir,
        })?;
        let mut agent = Agent::new(agent_type, workdir.to_string_lossy(), launched.window);
        agent.pid = launched.pid;
        agent.session_id = launched.session_id;
        self.store.add_agent(&repo.name, name, agent)?;
        Ok(())
    }

    /// Drop every agent of a repository. Returns how many were removed.
    fn clear_repo(&self, repo: &str) -> usize {
        let removed = match self.store.clear_agents(repo) {
            Ok(names) => {
                if !names.is_empty() {
                    info!(target = "fleetd::reconcile", repo = %repo, agents = ?names, "removed agents of unrecoverable repository");
                }
                names.len()
            }
            Err(error) => {
                warn!(target = "fleetd::reconcile", repo = %repo, error = %error, "failed clearing agents");
                0
            }
        };
        if let Err(error) = self.backends.messages.cleanup_orphaned(repo, &[]) {
            warn!(target = "fleetd::reconcile", repo = %repo, error = %error, "failed cleaning orphaned messages");
        }
        removed
    }

    /// Remove worktree directories no agent owns, then prune git's bookkeeping.
    pub fn sweep_orphans(&self) -> usize {
        let snapshot = self.store.snapshot();
        let mut total = 0;

        for repo in snapshot.repos.values() {
            let repo_dir = self.paths.repo_dir(&repo.name);
            let root = self.paths.worktree_root(&repo.name);
            if !repo_dir.is_dir() || !root.is_dir() {
                continue;
            }

            let registered: Vec<PathBuf> = repo
                .agents
                .values()
                .filter(|a| !a.worktree_path.is_empty())
                .map(|a| PathBuf::from(&a.worktree_path))
                .collect();

            match self
                .backends
                .worktrees
                .cleanup_orphans(&repo_dir, &root, &registered)
            {
                Ok(removed) => {
                    for path in &removed {
                        info!(target = "fleetd::reconcile", repo = %repo.name, path = %path.display(), "removed orphaned worktree");
                    }
                    total += removed.len();
                }
                Err(error) => {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, error = %error, "orphan scan failed");
                }
            }

            if let Err(error) = self.backends.worktrees.prune(&repo_dir) {
                warn!(target = "fleetd::reconcile", repo = %repo.name, error = %error, "worktree prune failed");
            }
        }
        total
    }

    /// Audit every agent's window and worktree right now, independent of the
    /// periodic cadence, and fix what is broken.
    pub fn repair_state(&self) -> RepairReport {
        let snapshot = self.store.snapshot();
        let mut report = RepairReport::default();
        let mut purged = 0;

        for repo in snapshot.repos.values() {
            match self.backends.terminal.has_session(&repo.tmux_session) {
                Ok(true) => {}
                Ok(false) => {
                    let removed = self.clear_repo(&repo.name);
                    report.agents_removed += removed;
                    continue;
                }
                Err(error) => {
                    warn!(target = "fleetd::reconcile", repo = %repo.name, error = %error, "failed checking session during repair");
                    continue;
                }
            }

            let mut doomed = Vec::new();
            for (name, agent) in sorted_agents(repo) {
                let reason = if agent.ready_for_cleanup {
                    Some(CleanupReason::Completed)
                } else if !self
                    .backends
                    .terminal
                    .has_window(&repo.tmux_session, &agent.tmux_window)
                    .unwrap_or(true)
                {
                    Some(CleanupReason::WindowGone)
                } else if agent.agent_type == AgentType::Worker
                    && !agent.worktree_path.is_empty()
                    && !Path::new(&agent.worktree_path).exists()
                {
                    Some(CleanupReason::WorktreeGone)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    doomed.push(Doomed {
                        name: name.clone(),
                        agent: agent.clone(),
                        reason,
                    });
                }
            }

            let outcome = self.cleanup(repo, doomed);
            report.agents_removed += outcome.removed;
            purged += outcome.messages_purged;
        }

        let orphans = self.sweep_orphans();
        report.issues_fixed = report.agents_removed + purged + orphans;
        info!(target = "fleetd::reconcile", agents_removed = report.agents_removed, issues_fixed = report.issues_fixed, "state repair finished");
        report
    }
}

fn sorted_agents(repo: &Repository) -> Vec<(&String, &Agent)> {
    let mut agents: Vec<(&String, &Agent)> = repo.agents.iter().collect();
    agents.sort_by(|a, b| a.0.cmp(b.0));
    agents
}
