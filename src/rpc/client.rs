//! Client side of the agent socket, used by the proxy.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::{PushRequest, Request, Response, codec};
use crate::error::{NodeupError, Result};

/// Anything that can hand a push request to the node's upgrade agent.
#[async_trait]
pub trait UpgradePusher: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<()>;
}

/// Connects to the agent socket once per call.
#[derive(Clone, Debug)]
pub struct AgentClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    fn unavailable(&self, reason: impl ToString) -> NodeupError {
        NodeupError::RpcUnavailable {
            path: self.socket_path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    async fn call(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| self.unavailable(e))?;
        let mut framed = Framed::new(stream, codec());

        let line =
            serde_json::to_string(request).map_err(|e| NodeupError::Protocol(e.to_string()))?;
        framed.send(line).await.map_err(|e| self.unavailable(e))?;

        match framed.next().await {
            Some(Ok(line)) => {
                serde_json::from_str(&line).map_err(|e| NodeupError::Protocol(e.to_string()))
            }
            Some(Err(e)) => Err(self.unavailable(e)),
            None => Err(self.unavailable("connection closed before reply")),
        }
    }
}

#[async_trait]
impl UpgradePusher for AgentClient {
    async fn push(&self, request: &PushRequest) -> Result<()> {
        debug!(
            socket = %self.socket_path.display(),
            kube_version = %request.kube_version,
            os_version = %request.os_version,
            control_plane = request.control_plane,
            "Sending upgrade request to agent"
        );

        let upgrade = Request::Upgrade(request.clone());
        let call = self.call(&upgrade);
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                self.unavailable(format!("no reply within {}s", self.timeout.as_secs()))
            })??;

        match response {
            Response::Ok => Ok(()),
            Response::Error { message } => Err(NodeupError::Remote(message)),
        }
    }
}
