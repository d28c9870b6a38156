//! Daemon wiring: startup, the periodic loops, and ordered shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{resolve_root, DaemonConfig, DaemonPaths, Intervals};
use crate::dispatch::Dispatcher;
use crate::launcher::Launcher;
use crate::logging;
use crate::messages::FsMessageStore;
use crate::process::SystemProbe;
use crate::reconcile::Reconciler;
use crate::rotate::Rotator;
use crate::router::Router;
use crate::singleton::SingletonGuard;
use crate::socket;
use crate::state::StateStore;
use crate::terminal::TmuxDriver;
use crate::triggers::{self, PassRunner, Trigger, TriggerQueue};
use crate::wake::WakeScheduler;
use crate::worktree::GitWorktrees;
use crate::Backends;

/// Foreground entry point for `fleetd run`. Any error here aborts startup.
pub async fn run(config: DaemonConfig) -> Result<()> {
    let root = resolve_root(config.root.as_deref());
    let paths = DaemonPaths::from_root(&root);
    paths
        .ensure_dirs()
        .with_context(|| format!("failed to create state directories under {}", root.display()))?;
    logging::init_file_logging(&config.log_level, &paths.log_file)?;

    let guard = SingletonGuard::acquire(&paths.pid_file, &paths.lock_file)
        .context("failed to claim daemon PID file")?;
    let store = Arc::new(
        StateStore::load(&paths.state_file)
            .with_context(|| format!("failed to load state from {}", paths.state_file.display()))?,
    );
    let backends = Backends {
        terminal: Arc::new(TmuxDriver::default()),
        worktrees: Arc::new(GitWorktrees),
        messages: Arc::new(FsMessageStore::new(paths.messages_dir.clone())),
        probe: Arc::new(SystemProbe),
    };
    let listener = socket::bind(&paths.socket_file)?;

    info!(target = "fleetd::daemon", pid = std::process::id(), root = %root.display(), "daemon started");
    let daemon = Daemon::new(paths, store, backends, config.agent_argv(), config.intervals());
    daemon.run_until(listener, shutdown_signal()).await?;

    guard.release().context("failed to remove PID file")?;
    info!(target = "fleetd::daemon", "daemon stopped");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(target = "fleetd::daemon", error = %e, "failed to register SIGTERM handler; only SIGINT stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!(target = "fleetd::daemon", "received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!(target = "fleetd::daemon", "received SIGINT, shutting down"),
    }
}

struct TriggeredPasses {
    reconciler: Arc<Reconciler>,
    router: Arc<Router>,
}

impl PassRunner for TriggeredPasses {
    fn run(&self, trigger: Trigger) {
        match trigger {
            Trigger::Reconcile => {
                self.reconciler.health_check();
            }
            Trigger::RouteMessages => {
                self.router.run_pass();
            }
        }
    }
}

pub struct Daemon {
    paths: DaemonPaths,
    store: Arc<StateStore>,
    backends: Backends,
    agent_argv: Vec<String>,
    intervals: Intervals,
}

impl Daemon {
    pub fn new(
        paths: DaemonPaths,
        store: Arc<StateStore>,
        backends: Backends,
        agent_argv: Vec<String>,
        intervals: Intervals,
    ) -> Self {
        Self {
            paths,
            store,
            backends,
            agent_argv,
            intervals,
        }
    }

    /// Serve until `external` resolves or a `stop` request arrives, then stop
    /// every loop, wait for them, and persist state.
    pub async fn run_until(
        self,
        listener: UnixListener,
        external: impl Future<Output = ()>,
    ) -> Result<()> {
        let launcher = Launcher::new(
            self.backends.terminal.clone(),
            self.agent_argv.clone(),
            self.paths.clone(),
        );
        let reconciler = Arc::new(Reconciler::new(
            self.store.clone(),
            self.backends.clone(),
            launcher.clone(),
            self.paths.clone(),
        ));
        let router = Arc::new(Router::new(self.store.clone(), self.backends.clone()));
        let wake = Arc::new(WakeScheduler::new(self.store.clone(), self.backends.clone()));
        let rotator = Rotator::new(self.paths.output_dir.clone());

        let (queue, trigger_rx) = TriggerQueue::new();
        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.backends.clone(),
            launcher,
            reconciler.clone(),
            queue,
            self.paths.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = mpsc::channel(1);

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        {
            let reconciler = reconciler.clone();
            tasks.push((
                "health",
                tokio::spawn(periodic("health", self.intervals.health, shutdown_rx.clone(), move || {
                    reconciler.health_check();
                    rotator.rotate();
                })),
            ));
        }
        {
            let router = router.clone();
            tasks.push((
                "route",
                tokio::spawn(periodic("route", self.intervals.route, shutdown_rx.clone(), move || {
                    router.run_pass();
                })),
            ));
        }
        tasks.push((
            "wake",
            tokio::spawn(periodic("wake", self.intervals.wake, shutdown_rx.clone(), move || {
                wake.run_pass(Utc::now());
            })),
        ));
        tasks.push((
            "triggers",
            tokio::spawn(triggers::drain(
                trigger_rx,
                Arc::new(TriggeredPasses { reconciler, router }),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "socket",
            tokio::spawn(socket::serve(listener, dispatcher, shutdown_rx, stop_tx)),
        ));

        tokio::pin!(external);
        tokio::select! {
            _ = &mut external => {}
            _ = stop_rx.recv() => info!(target = "fleetd::daemon", "stop requested over control socket"),
        }

        let _ = shutdown_tx.send(true);
        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(target = "fleetd::daemon", task = name, error = %e, "loop ended abnormally");
            }
        }

        if let Err(e) = self.store.save() {
            error!(target = "fleetd::daemon", error = %e, "failed to persist state on shutdown");
        }
        socket::remove_socket(&self.paths.socket_file);
        Ok(())
    }
}

/// Run `pass` on the blocking pool now and then every `every`, until shutdown.
/// A pass in flight is allowed to finish.
async fn periodic<F>(name: &'static str, every: Duration, mut shutdown: watch::Receiver<bool>, pass: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let pass = Arc::new(pass);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let pass = pass.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pass()).await {
            warn!(target = "fleetd::daemon", task = name, error = %e, "pass panicked");
        }
    }
    debug!(target = "fleetd::daemon", task = name, "loop stopped");
}
