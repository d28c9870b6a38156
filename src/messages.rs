//! Inter-agent message log, keyed by (repository, recipient).
//!
//! Layout on disk: `<root>/<repo>/<agent>/<message id>.json`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    /// Send order within this process; breaks ties between equal timestamps.
    #[serde(default)]
    pub seq: u64,
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn creation_order(a: &Message, b: &Message) -> std::cmp::Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.seq.cmp(&b.seq))
        .then_with(|| a.id.cmp(&b.id))
}

pub trait MessageStore: Send + Sync {
    fn send(&self, repo: &str, from: &str, to: &str, body: &str) -> Result<Message>;
    /// Pending messages for `agent`, oldest first.
    fn list_unread(&self, repo: &str, agent: &str) -> Result<Vec<Message>>;
    fn get(&self, repo: &str, agent: &str, id: &str) -> Result<Message>;
    fn update_status(&self, repo: &str, agent: &str, id: &str, status: MessageStatus)
        -> Result<()>;
    /// Drop message state for agents not in `live_agents`; returns how many were dropped.
    fn cleanup_orphaned(&self, repo: &str, live_agents: &[String]) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct FsMessageStore {
    root: PathBuf,
}

impl FsMessageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn agent_dir(&self, repo: &str, agent: &str) -> PathBuf {
        self.root.join(repo).join(agent)
    }

    fn message_path(&self, repo: &str, agent: &str, id: &str) -> PathBuf {
        self.agent_dir(repo, agent).join(format!("{id}.json"))
    }

    fn write(&self, path: &Path, message: &Message) -> Result<()> {
        let dir = path
            .parent()
            .with_context(|| format!("message path has no parent: {}", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create message dir {}", dir.display()))?;
        let body = serde_json::to_vec_pretty(message)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
        std::io::Write::write_all(&mut tmp, &body)?;
        tmp.persist(path)
            .with_context(|| format!("failed persisting message {}", path.display()))?;
        Ok(())
    }
}

impl MessageStore for FsMessageStore {
    fn send(&self, repo: &str, from: &str, to: &str, body: &str) -> Result<Message> {
        let message = Message {
            id: format!("msg-{}", Uuid::new_v4()),
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            status: MessageStatus::Pending,
            timestamp: Utc::now(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        };
        self.write(&self.message_path(repo, to, &message.id), &message)?;
        Ok(message)
    }

    fn list_unread(&self, repo: &str, agent: &str) -> Result<Vec<Message>> {
        let dir = self.agent_dir(repo, agent);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed reading {}", dir.display()));
            }
        };

        let mut messages = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading message {}", path.display()))?;
            match serde_json::from_str::<Message>(&raw) {
                Ok(message) if message.status == MessageStatus::Pending => messages.push(message),
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(target = "fleetd::messages", path = %path.display(), error = %error, "skipping unreadable message");
                }
            }
        }
        messages.sort_by(creation_order);
        Ok(messages)
    }

    fn get(&self, repo: &str, agent: &str, id: &str) -> Result<Message> {
        let path = self.message_path(repo, agent, id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("message {id} not found for {repo}/{agent}"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn update_status(
        &self,
        repo: &str,
        agent: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let mut message = self.get(repo, agent, id)?;
        message.status = status;
        self.write(&self.message_path(repo, agent, id), &message)
    }

    fn cleanup_orphaned(&self, repo: &str, live_agents: &[String]) -> Result<usize> {
        let dir = self.root.join(repo);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("failed reading {}", dir.display()));
            }
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if live_agents.iter().any(|a| a == &name) {
                continue;
            }
            std::fs::remove_dir_all(entry.path()).with_context(|| {
                format!("failed removing messages for {repo}/{name}")
            })?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::{FsMessageStore, Message, MessageStatus, MessageStore};
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn send_then_list_unread_in_creation_order() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        let first = store.send("demo", "supervisor", "w1", "one").unwrap();
        let second = store.send("demo", "supervisor", "w1", "two").unwrap();

        let unread = store.list_unread("demo", "w1").unwrap();
        let ids: Vec<_> = unread.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn equal_timestamps_keep_send_order() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        let now = Utc::now();
        // Ids sort opposite to send order.
        for (id, seq) in [("msg-z", 1), ("msg-a", 2)] {
            let message = Message {
                id: id.to_string(),
                from: "supervisor".to_string(),
                to: "w1".to_string(),
                body: id.to_string(),
                status: MessageStatus::Pending,
                timestamp: now,
                seq,
            };
            store
                .write(&store.message_path("demo", "w1", id), &message)
                .unwrap();
        }

        let unread = store.list_unread("demo", "w1").unwrap();
        let ids: Vec<_> = unread.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg-z", "msg-a"]);
    }

    #[test]
    fn messages_written_without_a_sequence_still_load() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        let agent_dir = dir.path().join("demo").join("w1");
        std::fs::create_dir_all(&agent_dir).unwrap();
        std::fs::write(
            agent_dir.join("msg-old.json"),
            r#"{"id":"msg-old","from":"supervisor","to":"w1","body":"hi","status":"pending","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let unread = store.list_unread("demo", "w1").unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].seq, 0);
    }

    #[test]
    fn delivered_messages_are_not_unread() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        let msg = store.send("demo", "supervisor", "w1", "hi").unwrap();
        store
            .update_status("demo", "w1", &msg.id, MessageStatus::Delivered)
            .unwrap();

        assert!(store.list_unread("demo", "w1").unwrap().is_empty());
        assert_eq!(
            store.get("demo", "w1", &msg.id).unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn unknown_recipient_has_empty_inbox() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        assert!(store.list_unread("demo", "nobody").unwrap().is_empty());
    }

    #[test]
    fn cleanup_orphaned_keeps_live_agents() {
        let dir = TempDir::new().unwrap();
        let store = FsMessageStore::new(dir.path());
        store.send("demo", "supervisor", "w1", "a").unwrap();
        store.send("demo", "supervisor", "gone", "b").unwrap();

        let removed = store
            .cleanup_orphaned("demo", &["w1".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_unread("demo", "w1").unwrap().len(), 1);
        assert!(!dir.path().join("demo").join("gone").exists());
    }
}
