//! Command handlers behind the control socket.
//!
//! Handlers are synchronous and may touch the terminal (`restart_agent`,
//! `repair_state`), so the socket layer runs them on the blocking pool.
//! Passes that would delay the reply are submitted to the trigger queue instead.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::DaemonPaths;
use crate::launcher::Launcher;
use crate::protocol::{Command, NewAgent, Request, Response};
use crate::reconcile::Reconciler;
use crate::state::{new_session_id, Agent, AgentType, Repository, StateStore, TaskRecord};
use crate::triggers::{Trigger, TriggerQueue};
use crate::Backends;

/// Recipient of worker completion notices.
pub const SUPERVISOR: &str = "supervisor";

/// A reply plus whether the daemon should begin shutting down once it is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub response: Response,
    pub shutdown: bool,
}

impl Outcome {
    fn reply(response: Response) -> Self {
        Self {
            response,
            shutdown: false,
        }
    }
}

type HandlerResult = Result<Value, String>;

pub struct Dispatcher {
    store: Arc<StateStore>,
    backends: Backends,
    launcher: Launcher,
    reconciler: Arc<Reconciler>,
    triggers: TriggerQueue,
    paths: DaemonPaths,
}

impl Dispatcher {
    pub fn new(
        store: Arc<StateStore>,
        backends: Backends,
        launcher: Launcher,
        reconciler: Arc<Reconciler>,
        triggers: TriggerQueue,
        paths: DaemonPaths,
    ) -> Self {
        Self {
            store,
            backends,
            launcher,
            reconciler,
            triggers,
            paths,
        }
    }

    pub fn handle(&self, request: &Request) -> Outcome {
        let command = match Command::decode(request) {
            Ok(command) => command,
            Err(error) => {
                warn!(target = "fleetd::dispatch", command = %request.command, error = %error, "rejected request");
                return Outcome::reply(Response::error(error));
            }
        };

        if command == Command::Stop {
            info!(target = "fleetd::dispatch", "stop requested");
            return Outcome {
                response: Response::ok("Daemon stopping"),
                shutdown: true,
            };
        }

        match self.execute(command) {
            Ok(data) => Outcome::reply(Response::ok(data)),
            Err(error) => Outcome::reply(Response::error(error)),
        }
    }

    fn execute(&self, command: Command) -> HandlerResult {
        match command {
            Command::Ping => Ok(json!("pong")),
            Command::Status => Ok(self.status()),
            Command::Stop => Ok(json!("Daemon stopping")),
            Command::ListRepos => Ok(self.list_repos()),
            Command::AddRepo {
                name,
                github_url,
                tmux_session,
            } => {
                let session = tmux_session.unwrap_or_else(|| format!("mc-{name}"));
                self.store
                    .add_repo(Repository::new(name.clone(), github_url, session))
                    .map_err(|e| e.to_string())?;
                info!(target = "fleetd::dispatch", repo = %name, "repository added");
                Ok(json!(format!("Repository '{name}' added")))
            }
            Command::RemoveRepo { name } => {
                self.store.remove_repo(&name).map_err(|e| e.to_string())?;
                info!(target = "fleetd::dispatch", repo = %name, "repository removed");
                Ok(json!(format!("Repository '{name}' removed")))
            }
            Command::AddAgent(new) => self.add_agent(new),
            Command::RemoveAgent { repo, agent } => {
                self.store
                    .remove_agent(&repo, &agent)
                    .map_err(|e| e.to_string())?;
                info!(target = "fleetd::dispatch", repo = %repo, agent = %agent, "agent removed");
                Ok(json!(format!("Agent '{agent}' removed")))
            }
            Command::ListAgents { repo } => self.list_agents(&repo),
            Command::CompleteAgent {
                repo,
                agent,
                summary,
            } => self.complete_agent(&repo, &agent, summary),
            Command::RestartAgent { repo, agent } => self.restart_agent(&repo, &agent),
            Command::TriggerCleanup => {
                self.triggers.submit(Trigger::Reconcile);
                Ok(json!("Cleanup triggered"))
            }
            Command::RepairState => {
                let report = self.reconciler.repair_state();
                Ok(json!({
                    "agents_removed": report.agents_removed,
                    "issues_fixed": report.issues_fixed,
                }))
            }
            Command::RouteMessages => {
                self.triggers.submit(Trigger::RouteMessages);
                Ok(json!("Message routing triggered"))
            }
            Command::GetRepoConfig { repo } => {
                let config = self.store.merge_queue(&repo).map_err(|e| e.to_string())?;
                Ok(json!({
                    "mq_enabled": config.enabled,
                    "mq_track_mode": config.track_mode.as_str(),
                }))
            }
            Command::UpdateRepoConfig {
                repo,
                enabled,
                track_mode,
            } => {
                let config = self
                    .store
                    .update_merge_queue(&repo, |c| {
                        if let Some(enabled) = enabled {
                            c.enabled = enabled;
                        }
                        if let Some(mode) = track_mode {
                            c.track_mode = mode;
                        }
                    })
                    .map_err(|e| e.to_string())?;
                Ok(json!({
                    "mq_enabled": config.enabled,
                    "mq_track_mode": config.track_mode.as_str(),
                }))
            }
            Command::SetCurrentRepo { name } => {
                self.store
                    .set_current_repo(&name)
                    .map_err(|e| e.to_string())?;
                Ok(json!(format!("Current repository set to '{name}'")))
            }
            Command::GetCurrentRepo => self
                .store
                .current_repo()
                .map(Value::String)
                .ok_or_else(|| "no current repository set".to_string()),
            Command::ClearCurrentRepo => {
                self.store.clear_current_repo();
                Ok(json!("Current repository cleared"))
            }
            Command::TaskHistory { repo, limit } => {
                let history = self
                    .store
                    .task_history(&repo, limit)
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(history).map_err(|e| e.to_string())
            }
        }
    }

    fn status(&self) -> Value {
        let (repos, agents) = self.store.counts();
        json!({
            "running": true,
            "pid": std::process::id(),
            "repos": repos,
            "agents": agents,
            "socket_path": self.paths.socket_file.display().to_string(),
        })
    }

    fn list_repos(&self) -> Value {
        let current = self.store.current_repo();
        let repos: Vec<Value> = self
            .store
            .list_repos()
            .into_iter()
            .map(|r| {
                json!({
                    "name": r.name,
                    "github_url": r.github_url,
                    "tmux_session": r.tmux_session,
                    "agents": r.agents.len(),
                    "current": current.as_deref() == Some(r.name.as_str()),
                })
            })
            .collect();
        Value::Array(repos)
    }

    fn add_agent(&self, new: NewAgent) -> HandlerResult {
        let window = if new.tmux_window.is_empty() {
            new.agent.clone()
        } else {
            new.tmux_window
        };
        let mut agent = Agent::new(new.agent_type, new.worktree_path, window);
        agent.session_id = new.session_id.unwrap_or_else(new_session_id);
        agent.pid = new.pid.unwrap_or(0);
        agent.task = new.task;

        self.store
            .add_agent(&new.repo, &new.agent, agent)
            .map_err(|e| e.to_string())?;
        info!(target = "fleetd::dispatch", repo = %new.repo, agent = %new.agent, agent_type = %new.agent_type, "agent added");
        Ok(json!(format!("Agent '{}' added", new.agent)))
    }

    fn list_agents(&self, repo: &str) -> HandlerResult {
        let agents = self.store.list_agents(repo).map_err(|e| e.to_string())?;
        let mut out = Vec::with_capacity(agents.len());
        for (name, agent) in agents {
            let mut value = serde_json::to_value(&agent).map_err(|e| e.to_string())?;
            if let Value::Object(map) = &mut value {
                map.insert("name".to_string(), Value::String(name));
            }
            out.push(value);
        }
        Ok(Value::Array(out))
    }

    fn complete_agent(&self, repo: &str, name: &str, summary: Option<String>) -> HandlerResult {
        let agent = self
            .store
            .update_agent(repo, name, None, |a| a.ready_for_cleanup = true)
            .map_err(|e| e.to_string())?;
        info!(target = "fleetd::dispatch", repo = %repo, agent = %name, "agent marked complete");

        if agent.agent_type == AgentType::Worker {
            let record = TaskRecord {
                name: name.to_string(),
                task: agent.task.clone(),
                summary: summary.clone(),
                completed_at: Utc::now(),
            };
            if let Err(error) = self.store.record_task(repo, record) {
                warn!(target = "fleetd::dispatch", repo = %repo, agent = %name, error = %error, "failed recording task history");
            }

            let body = completion_notice(name, agent.task.as_deref(), summary.as_deref());
            match self.backends.messages.send(repo, name, SUPERVISOR, &body) {
                Ok(_) => {
                    self.triggers.submit(Trigger::RouteMessages);
                }
                Err(error) => {
                    warn!(target = "fleetd::dispatch", repo = %repo, agent = %name, error = %error, "failed notifying supervisor");
                }
            }
        }

        self.triggers.submit(Trigger::Reconcile);
        Ok(json!(format!("Agent '{name}' marked for cleanup")))
    }

    fn restart_agent(&self, repo: &str, name: &str) -> HandlerResult {
        let repository = self.store.get_repo(repo).map_err(|e| e.to_string())?;
        let agent = self
            .store
            .get_agent(repo, name)
            .map_err(|e| e.to_string())?;
        if agent.ready_for_cleanup {
            return Err(format!(
                "agent '{name}' is marked as complete and pending cleanup - cannot restart a completed agent"
            ));
        }

        let launched = self
            .launcher
            .restart(repo, &repository.tmux_session, name, &agent)
            .map_err(|e| format!("{e:#}"))?;
        self.store
            .update_agent(repo, name, Some(agent.version), |a| {
                a.pid = launched.pid;
                a.tmux_window = launched.window.clone();
                a.session_id = launched.session_id.clone();
            })
            .map_err(|e| e.to_string())?;

        Ok(json!({
            "agent": name,
            "pid": launched.pid,
            "session_id": launched.session_id,
        }))
    }
}

fn completion_notice(name: &str, task: Option<&str>, summary: Option<&str>) -> String {
    let mut body = format!("Worker '{name}' has completed its task");
    if let Some(task) = task {
        body.push_str(&format!(": {task}"));
    }
    if let Some(summary) = summary {
        body.push_str(&format!(" (summary: {summary})"));
    }
    body.push('.');
    body
}
