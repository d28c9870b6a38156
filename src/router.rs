//! Delivers pending inter-agent messages into recipients' terminal windows.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::messages::{Message, MessageStatus};
use crate::state::{Agent, AgentType, StateStore};
use crate::Backends;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RouteReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Text typed into the recipient's window.
pub fn format_delivery(message: &Message) -> String {
    format!(
        "Message from {} [{}]: {}",
        message.from, message.id, message.body
    )
}

pub struct Router {
    store: Arc<StateStore>,
    backends: Backends,
}

impl Router {
    pub fn new(store: Arc<StateStore>, backends: Backends) -> Self {
        Self { store, backends }
    }

    pub fn run_pass(&self) -> RouteReport {
        let snapshot = self.store.snapshot();
        let mut report = RouteReport::default();

        for repo in snapshot.repos.values() {
            let mut agents: Vec<(&String, &Agent)> = repo.agents.iter().collect();
            agents.sort_by(|a, b| a.0.cmp(b.0));

            for (name, agent) in agents {
                if agent.agent_type == AgentType::Workspace {
                    continue;
                }
                let unread = match self.backends.messages.list_unread(&repo.name, name) {
                    Ok(unread) => unread,
                    Err(error) => {
                        warn!(target = "fleetd::router", repo = %repo.name, agent = %name, error = %error, "failed listing messages");
                        continue;
                    }
                };

                for message in unread
                    .iter()
                    .filter(|m| m.status == MessageStatus::Pending)
                {
                    match self.deliver(&repo.name, &repo.tmux_session, name, agent, message) {
                        Ok(()) => {
                            debug!(target = "fleetd::router", repo = %repo.name, agent = %name, id = %message.id, "delivered message");
                            report.delivered += 1;
                        }
                        Err(error) => {
                            warn!(target = "fleetd::router", repo = %repo.name, agent = %name, id = %message.id, error = %format!("{error:#}"), "delivery failed; message stays pending");
                            report.failed += 1;
                            // Later messages would overtake this one.
                            break;
                        }
                    }
                }
            }
        }

        if report.delivered > 0 || report.failed > 0 {
            info!(target = "fleetd::router", delivered = report.delivered, failed = report.failed, "routing pass finished");
        }
        report
    }

    fn deliver(
        &self,
        repo: &str,
        session: &str,
        name: &str,
        agent: &Agent,
        message: &Message,
    ) -> Result<()> {
        let terminal = &self.backends.terminal;
        terminal
            .send_text(session, &agent.tmux_window, &format_delivery(message))
            .context("sending message text")?;
        terminal
            .send_enter(session, &agent.tmux_window)
            .context("sending submit key")?;
        self.backends
            .messages
            .update_status(repo, name, &message.id, MessageStatus::Delivered)
            .context("marking message delivered")?;
        Ok(())
    }
}
