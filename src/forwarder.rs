//! Per-node loop: hands the desired state to the local agent once the
//! coordinator has selected this node, and clears the selection afterwards.

use std::sync::Arc;

use tracing::{debug, info};

use crate::crd::UpgradeSpec;
use crate::error::Result;
use crate::node::{MARKER_VALUE, NodeRecord, SELECTED_LABEL, completed_label};
use crate::rpc::PushRequest;
use crate::rpc::client::UpgradePusher;
use crate::store::{LabelChanges, NodeStore, update_labels};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Nothing to do for this node.
    Idle,
    /// Behind the target but not selected yet.
    Waiting,
    /// Request handed to the agent.
    Pushed,
    /// Node reached the target; selection marker removed.
    Cleared,
    /// Selection marker from an earlier target removed without pushing.
    Released,
}

pub struct Forwarder {
    node_name: String,
    nodes: Arc<dyn NodeStore>,
    agent: Arc<dyn UpgradePusher>,
}

impl Forwarder {
    pub fn new(
        node_name: impl Into<String>,
        nodes: Arc<dyn NodeStore>,
        agent: Arc<dyn UpgradePusher>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            nodes,
            agent,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Read this node and act on it.
    #[cfg(test)]
    async fn sync(&self, spec: &UpgradeSpec) -> Result<ForwardOutcome> {
        let node = self.nodes.get(&self.node_name).await?;
        self.sync_node(&node, spec).await
    }

    /// Act on an already observed copy of this node.
    pub async fn sync_node(
        &self,
        node: &NodeRecord,
        spec: &UpgradeSpec,
    ) -> Result<ForwardOutcome> {
        if spec.is_noop() {
            debug!(node = %node.name, "No upgrade target set");
            return Ok(ForwardOutcome::Idle);
        }

        if node.has_stale_selection(spec) {
            return self.release(node, spec).await;
        }

        if node.needs_upgrade(spec) {
            if !node.is_selected_for(spec) {
                debug!(node = %node.name, "Waiting to be selected");
                return Ok(ForwardOutcome::Waiting);
            }

            let request = PushRequest::new(spec, node.is_control_plane());
            info!(
                node = %node.name,
                kube_version = %request.kube_version,
                os_version = %request.os_version,
                control_plane = request.control_plane,
                "Forwarding upgrade request to agent"
            );
            self.agent.push(&request).await?;
            return Ok(ForwardOutcome::Pushed);
        }

        if node.status.unschedulable {
            debug!(node = %node.name, "Node is cordoned, leaving it to the operator");
        }

        let kube_version = spec.kube_version.clone();
        let cleared = update_labels(self.nodes.as_ref(), node, |current| {
            let mut changes = LabelChanges::new();
            if current.is_selected() {
                changes.insert(SELECTED_LABEL.to_string(), None);
                if !kube_version.is_empty() {
                    changes.insert(
                        completed_label(&kube_version),
                        Some(MARKER_VALUE.to_string()),
                    );
                }
            }
            changes
        })
        .await?;

        if cleared {
            info!(node = %node.name, "Node upgraded, selection cleared");
            Ok(ForwardOutcome::Cleared)
        } else {
            Ok(ForwardOutcome::Idle)
        }
    }

    /// Drop a marker set for a target that is no longer active. The
    /// coordinator selects the node again for the current target when its
    /// tier comes up.
    async fn release(&self, node: &NodeRecord, spec: &UpgradeSpec) -> Result<ForwardOutcome> {
        let released = update_labels(self.nodes.as_ref(), node, |current| {
            if current.has_stale_selection(spec) {
                LabelChanges::from([(SELECTED_LABEL.to_string(), None)])
            } else {
                LabelChanges::new()
            }
        })
        .await?;

        if released {
            info!(
                node = %node.name,
                previous = ?node.labels.get(SELECTED_LABEL),
                "Target changed, released stale selection"
            );
            Ok(ForwardOutcome::Released)
        } else {
            // Re-selected for the current target in the meantime.
            Ok(ForwardOutcome::Idle)
        }
    }
}
