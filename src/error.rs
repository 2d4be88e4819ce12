//! Custom error types for nodeup.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while coordinating or executing node upgrades.
#[derive(Error, Debug)]
pub enum NodeupError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Write conflict on node {0}")]
    Conflict(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node {node} did not reach the target version within {}s", timeout.as_secs())]
    SelectionTimeout { node: String, timeout: Duration },

    #[error("Upgrade agent unavailable at {path}: {reason}")]
    RpcUnavailable { path: String, reason: String },

    #[error("Upgrade agent returned an error: {0}")]
    Remote(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeupError {
    /// Returns true if the control loop should simply retry later.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Kube(_) | Self::Conflict(_) | Self::RpcUnavailable { .. }
        )
    }
}

pub type Result<T, E = NodeupError> = std::result::Result<T, E>;
