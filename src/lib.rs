pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod messages;
pub mod process;
pub mod protocol;
pub mod reconcile;
pub mod rotate;
pub mod router;
pub mod singleton;
pub mod socket;
pub mod state;
pub mod terminal;
pub mod triggers;
pub mod wake;
pub mod worktree;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::messages::MessageStore;
use crate::process::ProcessProbe;
use crate::terminal::Terminal;
use crate::worktree::Worktrees;

/// The external collaborators every engine talks to.
#[derive(Clone)]
pub struct Backends {
    pub terminal: Arc<dyn Terminal>,
    pub worktrees: Arc<dyn Worktrees>,
    pub messages: Arc<dyn MessageStore>,
    pub probe: Arc<dyn ProcessProbe>,
}
