//! Cluster-scope rollout: decides which nodes upgrade next.
//!
//! Control-plane nodes go first, one at a time. Workers follow in batches of
//! at most `maxUnavailable`, each selected node awaited before the next is
//! considered. All progress lives in node labels, so a restarted operator
//! picks up exactly where the previous one stopped.

pub mod wait;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::crd::UpgradeSpec;
use crate::error::{NodeupError, Result};
use crate::metrics::{Metrics, RoleLabels};
use crate::node::{NodeRecord, SELECTED_LABEL, selection_value};
use crate::store::{LabelChanges, NodeStore, update_labels};
use wait::{WaitSettings, wait_for_completion};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_UNAVAILABLE: usize = 2;

#[derive(Clone, Copy, Debug)]
pub struct CoordinatorSettings {
    /// How often a selected node is re-read while waiting for it.
    pub poll_interval: Duration,
    /// How long one selected node may take to report the target versions.
    pub completion_timeout: Duration,
    /// Worker throttle used when the `Upgrade` leaves `maxUnavailable` unset.
    pub default_max_unavailable: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            default_max_unavailable: DEFAULT_MAX_UNAVAILABLE,
        }
    }
}

/// Result of one coordinator pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Neither an OS nor a Kubernetes target is set.
    NoTarget,
    /// Nothing was selected or awaited.
    Steady,
    /// Nodes were selected or finished; run another pass right away.
    Advanced { selected: Vec<String> },
    /// A selected node missed its deadline and stays selected.
    Stalled { node: String },
}

pub struct Coordinator {
    nodes: Arc<dyn NodeStore>,
    settings: CoordinatorSettings,
    metrics: Arc<Metrics>,
}

impl Coordinator {
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        settings: CoordinatorSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            nodes,
            settings,
            metrics,
        }
    }

    /// Run one pass over the fleet for the given desired state.
    pub async fn pass(&self, spec: &UpgradeSpec) -> Result<PassOutcome> {
        if spec.is_noop() {
            warn!("Upgrade has neither osVersion nor kubeVersion set, nothing to do");
            return Ok(PassOutcome::NoTarget);
        }

        let nodes = self.nodes.list().await?;
        if !nodes.iter().any(|n| n.needs_upgrade(spec)) {
            debug!(nodes = nodes.len(), "All nodes at target versions");
            return Ok(PassOutcome::Steady);
        }

        let (control_planes, workers): (Vec<&NodeRecord>, Vec<&NodeRecord>) =
            nodes.iter().partition(|n| n.is_control_plane());

        if let Some(outcome) = self.control_plane_tier(&control_planes, spec).await? {
            return Ok(outcome);
        }
        self.worker_tier(&workers, spec).await
    }

    /// Upgrade at most one control-plane node. `None` means the tier is done.
    async fn control_plane_tier(
        &self,
        nodes: &[&NodeRecord],
        spec: &UpgradeSpec,
    ) -> Result<Option<PassOutcome>> {
        if let Some(node) = nodes
            .iter()
            .find(|n| n.is_selected_for(spec) && n.needs_upgrade(spec))
        {
            info!(node = %node.name, "Resuming wait on selected control-plane node");
            return Ok(Some(match self.await_node(node, spec).await {
                Ok(()) => PassOutcome::Advanced { selected: vec![] },
                Err(_) => PassOutcome::Stalled {
                    node: node.name.clone(),
                },
            }));
        }

        let Some(node) = nodes
            .iter()
            .find(|n| !n.is_selected_for(spec) && n.needs_upgrade(spec))
        else {
            return Ok(None);
        };

        self.select(node, spec).await?;
        Ok(Some(match self.await_node(node, spec).await {
            Ok(()) => PassOutcome::Advanced {
                selected: vec![node.name.clone()],
            },
            Err(_) => PassOutcome::Stalled {
                node: node.name.clone(),
            },
        }))
    }

    /// Upgrade up to `maxUnavailable` workers, one after another.
    async fn worker_tier(&self, nodes: &[&NodeRecord], spec: &UpgradeSpec) -> Result<PassOutcome> {
        let in_flight: Vec<&NodeRecord> = nodes
            .iter()
            .copied()
            .filter(|n| n.is_selected_for(spec) && n.needs_upgrade(spec))
            .collect();
        for node in &in_flight {
            info!(node = %node.name, "Resuming wait on selected worker node");
            if self.await_node(node, spec).await.is_err() {
                return Ok(PassOutcome::Stalled {
                    node: node.name.clone(),
                });
            }
        }

        let candidates: Vec<&NodeRecord> = nodes
            .iter()
            .copied()
            .filter(|n| !n.is_selected_for(spec) && n.needs_upgrade(spec))
            .collect();
        let limit = spec
            .effective_max_unavailable(self.settings.default_max_unavailable)
            .min(candidates.len());
        debug!(pending = candidates.len(), limit, "Selecting worker nodes");

        let mut selected = Vec::new();
        for candidate in candidates {
            if selected.len() >= limit {
                break;
            }

            let node = self.nodes.get(&candidate.name).await?;
            if !node.needs_upgrade(spec) {
                info!(node = %node.name, "Worker already at target version, ending pass");
                break;
            }

            self.select(&node, spec).await?;
            selected.push(node.name.clone());
            if self.await_node(&node, spec).await.is_err() {
                return Ok(PassOutcome::Stalled { node: node.name });
            }
        }

        if selected.is_empty() && in_flight.is_empty() {
            Ok(PassOutcome::Steady)
        } else {
            Ok(PassOutcome::Advanced { selected })
        }
    }

    /// Set the selected marker for this target with a conditional write.
    ///
    /// A marker left from an earlier target is overwritten.
    async fn select(&self, node: &NodeRecord, spec: &UpgradeSpec) -> Result<()> {
        let value = selection_value(spec);
        let written = update_labels(self.nodes.as_ref(), node, |current| {
            if current.is_selected_for(spec) {
                LabelChanges::new()
            } else {
                LabelChanges::from([(SELECTED_LABEL.to_string(), Some(value.clone()))])
            }
        })
        .await?;

        if written {
            info!(
                node = %node.name,
                control_plane = node.is_control_plane(),
                "Selected node for upgrade"
            );
            self.metrics
                .node_selections_total
                .get_or_create(&RoleLabels::new(node.is_control_plane()))
                .inc();
        }
        Ok(())
    }

    /// Bounded wait for `node`; a timeout is logged and leaves the node selected.
    async fn await_node(&self, node: &NodeRecord, spec: &UpgradeSpec) -> Result<()> {
        let role = RoleLabels::new(node.is_control_plane());
        let started = Instant::now();
        let settings = WaitSettings {
            poll_interval: self.settings.poll_interval,
            timeout: self.settings.completion_timeout,
        };

        match wait_for_completion(self.nodes.clone(), &node.name, spec, settings).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                info!(
                    node = %node.name,
                    elapsed_seconds = elapsed.as_secs(),
                    "Node reached target versions"
                );
                self.metrics
                    .selection_wait_seconds
                    .get_or_create(&role)
                    .observe(elapsed.as_secs_f64());
                Ok(())
            }
            Err(e @ NodeupError::SelectionTimeout { .. }) => {
                error!(
                    node = %node.name,
                    error = %e,
                    "Selected node is stuck, manual intervention required"
                );
                self.metrics
                    .selection_timeouts_total
                    .get_or_create(&role)
                    .inc();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
