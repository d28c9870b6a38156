//! In-memory stand-ins for the external collaborators.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::config::DaemonPaths;
use crate::messages::{Message, MessageStatus, MessageStore};
use crate::process::ProcessProbe;
use crate::terminal::Terminal;
use crate::worktree::Worktrees;
use crate::Backends;

#[derive(Debug, Clone, Default)]
struct FakeWindow {
    pid: u32,
    argv: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeTerminal {
    sessions: Mutex<HashMap<String, HashMap<String, FakeWindow>>>,
    sent: Mutex<Vec<(String, String, String)>>,
    enters: Mutex<Vec<(String, String)>>,
    killed: Mutex<Vec<(String, String)>>,
    next_pid: AtomicU32,
    pub fail_send_text: Mutex<bool>,
    pub fail_send_enter: Mutex<bool>,
    pub fail_create_session: Mutex<bool>,
    pub fail_kill: Mutex<bool>,
}

impl FakeTerminal {
    fn alloc_pid(&self) -> u32 {
        5000 + self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_session(&self, session: &str) {
        self.sessions
            .lock()
            .entry(session.to_string())
            .or_default();
    }

    pub fn add_window(&self, session: &str, window: &str, pid: u32) {
        self.sessions
            .lock()
            .entry(session.to_string())
            .or_default()
            .insert(
                window.to_string(),
                FakeWindow {
                    pid,
                    argv: Vec::new(),
                },
            );
    }

    pub fn remove_window(&self, session: &str, window: &str) {
        if let Some(windows) = self.sessions.lock().get_mut(session) {
            windows.remove(window);
        }
    }

    pub fn session_exists(&self, session: &str) -> bool {
        self.sessions.lock().contains_key(session)
    }

    pub fn window_exists(&self, session: &str, window: &str) -> bool {
        self.sessions
            .lock()
            .get(session)
            .is_some_and(|w| w.contains_key(window))
    }

    pub fn last_argv(&self, session: &str, window: &str) -> Option<Vec<String>> {
        self.sessions
            .lock()
            .get(session)
            .and_then(|w| w.get(window))
            .map(|w| w.argv.clone())
    }

    pub fn sent_texts(&self) -> Vec<(String, String, String)> {
        self.sent.lock().clone()
    }

    pub fn enter_count(&self) -> usize {
        self.enters.lock().len()
    }

    pub fn killed_windows(&self) -> Vec<(String, String)> {
        self.killed.lock().clone()
    }
}

impl Terminal for FakeTerminal {
    fn has_session(&self, session: &str) -> Result<bool> {
        Ok(self.session_exists(session))
    }

    fn create_session(&self, session: &str, _workdir: &Path) -> Result<()> {
        if *self.fail_create_session.lock() {
            bail!("create-session failed");
        }
        self.add_session(session);
        Ok(())
    }

    fn has_window(&self, session: &str, window: &str) -> Result<bool> {
        Ok(self.window_exists(session, window))
    }

    fn kill_window(&self, session: &str, window: &str) -> Result<()> {
        self.killed
            .lock()
            .push((session.to_string(), window.to_string()));
        if *self.fail_kill.lock() {
            bail!("kill-window failed");
        }
        self.remove_window(session, window);
        Ok(())
    }

    fn send_text(&self, session: &str, window: &str, text: &str) -> Result<()> {
        if *self.fail_send_text.lock() {
            bail!("send-keys failed");
        }
        if !self.window_exists(session, window) {
            bail!("no such window {session}:{window}");
        }
        self.sent
            .lock()
            .push((session.to_string(), window.to_string(), text.to_string()));
        Ok(())
    }

    fn send_enter(&self, session: &str, window: &str) -> Result<()> {
        if *self.fail_send_enter.lock() {
            bail!("send-keys Enter failed");
        }
        self.enters
            .lock()
            .push((session.to_string(), window.to_string()));
        Ok(())
    }

    fn pane_pid(&self, session: &str, window: &str) -> Result<u32> {
        match self.sessions.lock().get(session).and_then(|w| w.get(window)) {
            Some(w) => Ok(w.pid),
            None => bail!("no such window {session}:{window}"),
        }
    }

    fn new_window(
        &self,
        session: &str,
        window: &str,
        _workdir: &Path,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<u32> {
        let pid = self.alloc_pid();
        let mut sessions = self.sessions.lock();
        let Some(windows) = sessions.get_mut(session) else {
            bail!("no such session {session}");
        };
        windows.insert(
            window.to_string(),
            FakeWindow {
                pid,
                argv: argv.to_vec(),
            },
        );
        Ok(pid)
    }

    fn respawn_window(
        &self,
        session: &str,
        window: &str,
        _workdir: &Path,
        argv: &[String],
        _env: &[(String, String)],
    ) -> Result<u32> {
        let pid = self.alloc_pid();
        let mut sessions = self.sessions.lock();
        let Some(w) = sessions.get_mut(session).and_then(|w| w.get_mut(window)) else {
            bail!("no such window {session}:{window}");
        };
        w.pid = pid;
        w.argv = argv.to_vec();
        Ok(pid)
    }

    fn pipe_output(&self, _session: &str, _window: &str, _log_path: &Path) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeWorktrees {
    repositories: Mutex<HashSet<PathBuf>>,
    pub created: Mutex<Vec<PathBuf>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub prunes: Mutex<usize>,
    pub orphan_scans: Mutex<Vec<(PathBuf, Vec<PathBuf>)>>,
}

impl FakeWorktrees {
    pub fn mark_repository(&self, path: &Path) {
        self.repositories.lock().insert(path.to_path_buf());
    }
}

impl Worktrees for FakeWorktrees {
    fn is_repository(&self, path: &Path) -> bool {
        self.repositories.lock().contains(path)
    }

    fn create(&self, _repo_dir: &Path, path: &Path, _branch: &str) -> Result<()> {
        self.created.lock().push(path.to_path_buf());
        Ok(())
    }

    fn remove(&self, _repo_dir: &Path, path: &Path, _force: bool) -> Result<()> {
        self.removed.lock().push(path.to_path_buf());
        Ok(())
    }

    fn prune(&self, _repo_dir: &Path) -> Result<()> {
        *self.prunes.lock() += 1;
        Ok(())
    }

    fn cleanup_orphans(
        &self,
        _repo_dir: &Path,
        root: &Path,
        registered: &[PathBuf],
    ) -> Result<Vec<PathBuf>> {
        self.orphan_scans
            .lock()
            .push((root.to_path_buf(), registered.to_vec()));
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMessages {
    messages: Mutex<Vec<(String, Message)>>,
    counter: AtomicU32,
    pub fail_update: Mutex<bool>,
    pub cleanups: Mutex<Vec<(String, Vec<String>)>>,
}

impl MessageStore for MemoryMessages {
    fn send(&self, repo: &str, from: &str, to: &str, body: &str) -> Result<Message> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id: format!("msg-{n:04}"),
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            status: MessageStatus::Pending,
            timestamp: Utc::now() + Duration::milliseconds(i64::from(n)),
            seq: u64::from(n),
        };
        self.messages
            .lock()
            .push((repo.to_string(), message.clone()));
        Ok(message)
    }

    fn list_unread(&self, repo: &str, agent: &str) -> Result<Vec<Message>> {
        let mut out: Vec<Message> = self
            .messages
            .lock()
            .iter()
            .filter(|(r, m)| r == repo && m.to == agent && m.status == MessageStatus::Pending)
            .map(|(_, m)| m.clone())
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.seq.cmp(&b.seq)));
        Ok(out)
    }

    fn get(&self, repo: &str, agent: &str, id: &str) -> Result<Message> {
        match self
            .messages
            .lock()
            .iter()
            .find(|(r, m)| r == repo && m.to == agent && m.id == id)
        {
            Some((_, m)) => Ok(m.clone()),
            None => bail!("message {id} not found"),
        }
    }

    fn update_status(
        &self,
        repo: &str,
        agent: &str,
        id: &str,
        status: MessageStatus,
    ) -> Result<()> {
        if *self.fail_update.lock() {
            bail!("status write failed");
        }
        let mut messages = self.messages.lock();
        match messages
            .iter_mut()
            .find(|(r, m)| r == repo && m.to == agent && m.id == id)
        {
            Some((_, m)) => {
                m.status = status;
                Ok(())
            }
            None => bail!("message {id} not found"),
        }
    }

    fn cleanup_orphaned(&self, repo: &str, live_agents: &[String]) -> Result<usize> {
        self.cleanups
            .lock()
            .push((repo.to_string(), live_agents.to_vec()));
        let mut messages = self.messages.lock();
        let before = messages.len();
        messages.retain(|(r, m)| r != repo || live_agents.contains(&m.to));
        Ok(before - messages.len())
    }
}

#[derive(Debug, Default)]
pub struct FakeProbe {
    dead: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn kill(&self, pid: u32) {
        self.dead.lock().insert(pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}

/// A full set of fakes plus the backends bundle that wraps them.
pub struct Harness {
    pub terminal: Arc<FakeTerminal>,
    pub worktrees: Arc<FakeWorktrees>,
    pub messages: Arc<MemoryMessages>,
    pub probe: Arc<FakeProbe>,
    pub paths: DaemonPaths,
    pub backends: Backends,
    _root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::TempDir::new().expect("temp dir");
        let paths = DaemonPaths::from_root(root.path());
        let terminal = Arc::new(FakeTerminal::default());
        let worktrees = Arc::new(FakeWorktrees::default());
        let messages = Arc::new(MemoryMessages::default());
        let probe = Arc::new(FakeProbe::default());
        let backends = Backends {
            terminal: terminal.clone(),
            worktrees: worktrees.clone(),
            messages: messages.clone(),
            probe: probe.clone(),
        };
        Self {
            terminal,
            worktrees,
            messages,
            probe,
            paths,
            backends,
            _root: root,
        }
    }
}
