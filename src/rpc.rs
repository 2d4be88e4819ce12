//! Proxy-to-agent protocol: newline-delimited JSON over a Unix socket.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

use crate::crd::UpgradeSpec;

/// Default location of the agent socket on the host.
pub const DEFAULT_SOCKET_PATH: &str = "/run/nodeup/agent.sock";

/// Upper bound for one encoded message.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Per-node subset of the desired state sent to the agent.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PushRequest {
    pub kube_version: String,
    pub os_version: String,
    pub os_image_url: String,
    pub control_plane: bool,
}

impl PushRequest {
    pub fn new(spec: &UpgradeSpec, control_plane: bool) -> Self {
        Self {
            kube_version: spec.kube_version.clone(),
            os_version: spec.os_version.clone(),
            os_image_url: spec.os_image_url.clone(),
            control_plane,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Upgrade(PushRequest),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok,
    Error { message: String },
}

fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}
