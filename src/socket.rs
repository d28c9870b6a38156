//! Control socket: one newline-delimited JSON request per connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::protocol::{Request, Response};

const MAX_REQUEST_BYTES: u64 = 1_048_576;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Time between answering `stop` and starting shutdown, so the caller sees the reply.
pub const STOP_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("json serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("daemon closed the connection without replying")]
    NoReply,
}

/// Bind the control socket, replacing a stale socket file left by a dead daemon.
pub fn bind(path: &Path) -> Result<UnixListener, SocketError> {
    remove_socket(path);
    let listener = UnixListener::bind(path).map_err(|source| SocketError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            warn!(target = "fleetd::socket", path = %path.display(), error = %e, "failed to set socket permissions to 0600");
        }
    }
    info!(target = "fleetd::socket", path = %path.display(), "control socket listening");
    Ok(listener)
}

pub fn remove_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(target = "fleetd::socket", path = %path.display(), error = %e, "failed to remove socket file");
        }
    }
}

/// Accept connections until shutdown. `stop` is signalled after a `stop` request
/// has been answered.
pub async fn serve(
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
    stop: mpsc::Sender<()>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let dispatcher = dispatcher.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, dispatcher, stop).await {
                            debug!(target = "fleetd::socket", error = %e, "connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(target = "fleetd::socket", error = %e, "failed to accept connection");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(target = "fleetd::socket", "control socket stopped");
}

async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    stop: mpsc::Sender<()>,
) -> Result<(), SocketError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    let response = match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Err(_) => Response::error("timed out waiting for request"),
        Ok(Err(e)) => Response::error(format!("failed to read request: {e}")),
        Ok(Ok(0)) => return Ok(()),
        Ok(Ok(_)) => match serde_json::from_str::<Request>(line.trim()) {
            Err(e) => Response::error(format!("invalid request: {e}")),
            Ok(request) => {
                debug!(target = "fleetd::socket", command = %request.command, "handling request");
                let handled =
                    tokio::task::spawn_blocking(move || dispatcher.handle(&request)).await;
                match handled {
                    Ok(outcome) => {
                        if outcome.shutdown {
                            tokio::spawn(async move {
                                tokio::time::sleep(STOP_GRACE).await;
                                let _ = stop.try_send(());
                            });
                        }
                        outcome.response
                    }
                    Err(e) => {
                        error!(target = "fleetd::socket", error = %e, "request handler panicked");
                        Response::error("internal error")
                    }
                }
            }
        },
    };

    let mut body = serde_json::to_vec(&response)?;
    body.push(b'\n');
    write_half.write_all(&body).await?;
    write_half.flush().await?;
    let _ = write_half.shutdown().await;
    Ok(())
}

/// Send one request to the daemon listening at `path` and wait for its reply.
pub async fn send_request(path: &Path, request: &Request) -> Result<Response, SocketError> {
    let stream = UnixStream::connect(path).await?;
    let (read_half, mut write_half) = stream.into_split();

    let mut body = serde_json::to_vec(request)?;
    body.push(b'\n');
    write_half.write_all(&body).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(SocketError::NoReply);
    }
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Launcher;
    use crate::reconcile::Reconciler;
    use crate::state::StateStore;
    use crate::testing::Harness;
    use crate::triggers::TriggerQueue;

    fn dispatcher(h: &Harness) -> Arc<Dispatcher> {
        let store = Arc::new(StateStore::in_memory());
        let launcher = Launcher::new(h.backends.terminal.clone(), vec!["claude".into()], h.paths.clone());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            h.backends.clone(),
            launcher.clone(),
            h.paths.clone(),
        ));
        let (queue, _rx) = TriggerQueue::new();
        Arc::new(Dispatcher::new(
            store,
            h.backends.clone(),
            launcher,
            reconciler,
            queue,
            h.paths.clone(),
        ))
    }

    #[tokio::test]
    async fn ping_status_and_stop_over_the_socket() {
        let h = Harness::new();
        std::fs::create_dir_all(&h.paths.root).unwrap();
        let path = h.paths.socket_file.clone();
        let listener = bind(&path).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let server = tokio::spawn(serve(listener, dispatcher(&h), shutdown_rx, stop_tx));

        let pong = send_request(&path, &Request::new("ping")).await.unwrap();
        assert_eq!(pong, Response::ok("pong"));

        let status = send_request(&path, &Request::new("status")).await.unwrap();
        let data = status.data.unwrap();
        assert_eq!(data["repos"], 0);
        assert_eq!(data["socket_path"], path.display().to_string());

        let bad = send_request(&path, &Request::new("add_repo")).await.unwrap();
        assert_eq!(bad.error.as_deref(), Some("missing 'name': repository name is required"));

        let stop = send_request(&path, &Request::new("stop")).await.unwrap();
        assert!(stop.success);
        tokio::time::timeout(Duration::from_secs(5), stop_rx.recv())
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_gets_an_error_reply() {
        let h = Harness::new();
        std::fs::create_dir_all(&h.paths.root).unwrap();
        let path = h.paths.socket_file.clone();
        let listener = bind(&path).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        tokio::spawn(serve(listener, dispatcher(&h), shutdown_rx, stop_tx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{not json\n").await.unwrap();
        let mut raw = String::new();
        BufReader::new(stream).read_line(&mut raw).await.unwrap();
        let response: Response = serde_json::from_str(raw.trim()).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("invalid request"));
    }

    #[test]
    fn bind_replaces_stale_socket_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.sock");
        std::fs::write(&path, b"stale").unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            assert!(bind(&path).is_ok());
        });
    }
}
