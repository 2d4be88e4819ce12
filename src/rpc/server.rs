//! Server side of the agent socket.

use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::{PushRequest, Request, Response, codec};
use crate::error::Result;

/// Owner and group read/write, nothing for others.
pub const SOCKET_MODE: u32 = 0o660;

/// Executes push requests on the node.
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    async fn upgrade(&self, request: &PushRequest) -> Result<()>;
}

/// Bind the agent socket, replacing any stale socket left at `path`.
///
/// The socket is owned by root and handed to `group_id` when given.
pub fn bind(path: &Path, group_id: Option<u32>) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
    if let Some(gid) = group_id {
        std::os::unix::fs::chown(path, Some(0), Some(gid))?;
    }

    info!(socket = %path.display(), mode = format!("{SOCKET_MODE:o}"), "Agent socket bound");
    Ok(listener)
}

/// Accept connections until `shutdown` resolves.
pub async fn serve<F>(listener: UnixListener, handler: Arc<dyn UpgradeHandler>, shutdown: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, handler).await;
                    });
                }
                Err(e) => error!(error = %e, "Failed to accept agent connection"),
            },
            () = &mut shutdown => {
                info!("Agent server shutting down");
                return;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handler: Arc<dyn UpgradeHandler>) {
    let mut framed = Framed::new(stream, codec());

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to read agent request");
                return;
            }
        };

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Upgrade(request)) => match handler.upgrade(&request).await {
                Ok(()) => Response::Ok,
                Err(e) => {
                    error!(error = %e, kube_version = %request.kube_version, "Upgrade failed");
                    Response::Error {
                        message: e.to_string(),
                    }
                }
            },
            Err(e) => Response::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(error = %e, "Failed to encode agent response");
                return;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            warn!(error = %e, "Failed to write agent response");
            return;
        }
    }
}
