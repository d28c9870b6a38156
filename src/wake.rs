//! Periodic status nudges.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::state::{Agent, AgentType, StateStore};
use crate::Backends;

/// Minimum gap between two nudges of the same agent.
pub const NUDGE_COOLDOWN_SECS: i64 = 120;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WakeReport {
    pub nudged: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn nudge_text(agent_type: AgentType) -> Option<&'static str> {
    match agent_type {
        AgentType::Supervisor => {
            Some("Status check: Review worker progress and check merge queue.")
        }
        AgentType::MergeQueue => Some("Status check: Review open PRs and check CI status."),
        AgentType::Worker => Some("Status check: Update on your progress?"),
        AgentType::Workspace => None,
    }
}

/// True when `last` is unset or at least one cooldown before `now`.
pub fn cooled_down(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= Duration::seconds(NUDGE_COOLDOWN_SECS),
    }
}

pub struct WakeScheduler {
    store: Arc<StateStore>,
    backends: Backends,
}

impl WakeScheduler {
    pub fn new(store: Arc<StateStore>, backends: Backends) -> Self {
        Self { store, backends }
    }

    pub fn run_pass(&self, now: DateTime<Utc>) -> WakeReport {
        let snapshot = self.store.snapshot();
        let mut report = WakeReport::default();

        for repo in snapshot.repos.values() {
            for (name, agent) in &repo.agents {
                let Some(text) = nudge_text(agent.agent_type) else {
                    continue;
                };
                if !cooled_down(agent.last_nudge, now) {
                    report.skipped += 1;
                    continue;
                }

                if let Err(error) = self.nudge(&repo.tmux_session, agent, text) {
                    warn!(target = "fleetd::wake", repo = %repo.name, agent = %name, error = %error, "nudge failed");
                    report.failed += 1;
                    continue;
                }
                if let Err(error) = self.store.record_nudge(&repo.name, name, now) {
                    warn!(target = "fleetd::wake", repo = %repo.name, agent = %name, error = %error, "failed recording nudge");
                    continue;
                }
                debug!(target = "fleetd::wake", repo = %repo.name, agent = %name, "nudged agent");
                report.nudged += 1;
            }
        }
        report
    }

    fn nudge(&self, session: &str, agent: &Agent, text: &str) -> Result<()> {
        self.backends
            .terminal
            .send_text(session, &agent.tmux_window, text)?;
        self.backends.terminal.send_enter(session, &agent.tmux_window)
    }
}
