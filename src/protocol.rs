//! Control-socket wire types.
//!
//! A request is `{"command": "...", "args": {...}}`, one JSON object per line.
//! `args` is loosely typed on the wire; [`Command::decode`] turns it into a
//! typed command or a human-readable validation error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::state::{AgentType, TrackMode};

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    pub repo: String,
    pub agent: String,
    pub agent_type: AgentType,
    pub worktree_path: String,
    pub tmux_window: String,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Status,
    Stop,
    ListRepos,
    AddRepo {
        name: String,
        github_url: String,
        tmux_session: Option<String>,
    },
    RemoveRepo {
        name: String,
    },
    AddAgent(NewAgent),
    RemoveAgent {
        repo: String,
        agent: String,
    },
    ListAgents {
        repo: String,
    },
    CompleteAgent {
        repo: String,
        agent: String,
        summary: Option<String>,
    },
    RestartAgent {
        repo: String,
        agent: String,
    },
    TriggerCleanup,
    RepairState,
    RouteMessages,
    GetRepoConfig {
        repo: String,
    },
    UpdateRepoConfig {
        repo: String,
        enabled: Option<bool>,
        track_mode: Option<TrackMode>,
    },
    SetCurrentRepo {
        name: String,
    },
    GetCurrentRepo,
    ClearCurrentRepo,
    TaskHistory {
        repo: String,
        limit: usize,
    },
}

const REPO: (&str, &str) = ("repo", "repository name");
const AGENT: (&str, &str) = ("agent", "agent name");
const NAME: (&str, &str) = ("name", "repository name");

impl Command {
    pub fn decode(request: &Request) -> Result<Self, String> {
        let args = Args(&request.args);
        let command = match request.command.as_str() {
            "ping" => Command::Ping,
            "status" => Command::Status,
            "stop" => Command::Stop,
            "list_repos" => Command::ListRepos,
            "add_repo" => Command::AddRepo {
                name: args.required(NAME)?,
                github_url: args.required(("github_url", "repository URL"))?,
                tmux_session: args.optional_str("tmux_session")?,
            },
            "remove_repo" => Command::RemoveRepo {
                name: args.required(NAME)?,
            },
            "add_agent" => Command::AddAgent(NewAgent {
                repo: args.required(REPO)?,
                agent: args.required(AGENT)?,
                agent_type: args
                    .required(("type", "agent type"))?
                    .parse::<AgentType>()?,
                worktree_path: args.optional_str("worktree_path")?.unwrap_or_default(),
                tmux_window: args.optional_str("tmux_window")?.unwrap_or_default(),
                session_id: args.optional_str("session_id")?,
                pid: args
                    .optional_u64("pid")?
                    .map(|pid| u32::try_from(pid).map_err(|_| "invalid 'pid': out of range".to_string()))
                    .transpose()?,
                task: args.optional_str("task")?,
            }),
            "remove_agent" => Command::RemoveAgent {
                repo: args.required(REPO)?,
                agent: args.required(AGENT)?,
            },
            "list_agents" => Command::ListAgents {
                repo: args.required(REPO)?,
            },
            "complete_agent" => Command::CompleteAgent {
                repo: args.required(REPO)?,
                agent: args.required(AGENT)?,
                summary: args.optional_str("summary")?,
            },
            "restart_agent" => Command::RestartAgent {
                repo: args.required(REPO)?,
                agent: args.required(AGENT)?,
            },
            "trigger_cleanup" => Command::TriggerCleanup,
            "repair_state" => Command::RepairState,
            "route_messages" => Command::RouteMessages,
            "get_repo_config" => Command::GetRepoConfig {
                repo: args.required(REPO)?,
            },
            "update_repo_config" => Command::UpdateRepoConfig {
                repo: args.required(REPO)?,
                enabled: args.optional_bool("mq_enabled")?,
                track_mode: args
                    .optional_str("mq_track_mode")?
                    .map(|mode| mode.parse::<TrackMode>())
                    .transpose()?,
            },
            "set_current_repo" => Command::SetCurrentRepo {
                name: args.required(NAME)?,
            },
            "get_current_repo" => Command::GetCurrentRepo,
            "clear_current_repo" => Command::ClearCurrentRepo,
            "task_history" => Command::TaskHistory {
                repo: args.required(REPO)?,
                limit: args
                    .optional_u64("limit")?
                    .map(|n| n as usize)
                    .unwrap_or(DEFAULT_HISTORY_LIMIT),
            },
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(command)
    }
}

struct Args<'a>(&'a Map<String, Value>);

impl Args<'_> {
    /// A non-empty string; absent, empty, or wrong-typed values are all "missing".
    fn required(&self, (key, what): (&str, &str)) -> Result<String, String> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            _ => Err(format!("missing '{key}': {what} is required")),
        }
    }

    fn optional_str(&self, key: &str) -> Result<Option<String>, String> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(format!("invalid '{key}': expected a string")),
        }
    }

    fn optional_bool(&self, key: &str) -> Result<Option<bool>, String> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(format!("invalid '{key}': expected a boolean")),
        }
    }

    /// Whole non-negative numbers, sent as either integers or floats.
    fn optional_u64(&self, key: &str) -> Result<Option<u64>, String> {
        let invalid = || format!("invalid '{key}': expected a non-negative whole number");
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64() {
                    return Ok(Some(v));
                }
                match n.as_f64() {
                    Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
                        Ok(Some(f as u64))
                    }
                    _ => Err(invalid()),
                }
            }
            Some(_) => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(raw: Value) -> Result<Command, String> {
        let request: Request = serde_json::from_value(raw).unwrap();
        Command::decode(&request)
    }

    #[test]
    fn args_default_to_empty() {
        assert_eq!(decode(json!({"command": "ping"})), Ok(Command::Ping));
    }

    #[test]
    fn missing_fields_name_the_field() {
        assert_eq!(
            decode(json!({"command": "restart_agent", "args": {"agent": "w1"}})),
            Err("missing 'repo': repository name is required".to_string())
        );
        assert_eq!(
            decode(json!({"command": "restart_agent", "args": {"repo": "demo"}})),
            Err("missing 'agent': agent name is required".to_string())
        );
        // Wrong type counts as missing.
        assert_eq!(
            decode(json!({"command": "remove_repo", "args": {"name": 7}})),
            Err("missing 'name': repository name is required".to_string())
        );
    }

    #[test]
    fn pid_accepts_int_and_float() {
        for pid in [json!(4242), json!(4242.0)] {
            let cmd = decode(json!({
                "command": "add_agent",
                "args": {"repo": "demo", "agent": "w1", "type": "worker", "pid": pid}
            }))
            .unwrap();
            let Command::AddAgent(agent) = cmd else {
                panic!("expected add_agent");
            };
            assert_eq!(agent.pid, Some(4242));
            assert_eq!(agent.session_id, None);
        }
        assert!(decode(json!({
            "command": "add_agent",
            "args": {"repo": "demo", "agent": "w1", "type": "worker", "pid": 1.5}
        }))
        .is_err());
    }

    #[test]
    fn unknown_command_and_bad_track_mode() {
        assert_eq!(
            decode(json!({"command": "explode"})),
            Err("unknown command: explode".to_string())
        );
        let err = decode(json!({
            "command": "update_repo_config",
            "args": {"repo": "demo", "mq_track_mode": "everyone"}
        }))
        .unwrap_err();
        assert!(err.starts_with("invalid track mode"));
    }

    #[test]
    fn task_history_limit_defaults() {
        assert_eq!(
            decode(json!({"command": "task_history", "args": {"repo": "demo"}})),
            Ok(Command::TaskHistory {
                repo: "demo".into(),
                limit: DEFAULT_HISTORY_LIMIT
            })
        );
        assert_eq!(
            decode(json!({"command": "task_history", "args": {"repo": "demo", "limit": 3.0}})),
            Ok(Command::TaskHistory {
                repo: "demo".into(),
                limit: 3
            })
        );
    }

    #[test]
    fn response_omits_empty_fields() {
        let raw = serde_json::to_string(&Response::error("boom")).unwrap();
        assert_eq!(raw, r#"{"success":false,"error":"boom"}"#);
    }
}
