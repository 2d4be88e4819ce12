//! Prometheus metrics for the nodeup operator.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: String,
}

/// Labels for per-node metrics: `control-plane` or `worker`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RoleLabels {
    pub role: String,
}

impl RoleLabels {
    pub fn new(control_plane: bool) -> Self {
        Self {
            role: if control_plane { "control-plane" } else { "worker" }.to_string(),
        }
    }
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub node_selections_total: Family<RoleLabels, Counter>,
    pub selection_timeouts_total: Family<RoleLabels, Counter>,
    pub selection_wait_seconds: Family<RoleLabels, Histogram>,
}

/// Buckets for a node upgrade (5s to 1h): a kubeadm apply plus kubelet restart
/// takes minutes, an OS rebase with reboot longer.
const SELECTION_WAIT_BUCKETS: &[f64] = &[
    5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "nodeup_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let node_selections_total = Family::<RoleLabels, Counter>::default();
        registry.register(
            "nodeup_node_selections",
            "Total number of nodes selected for upgrade",
            node_selections_total.clone(),
        );

        let selection_timeouts_total = Family::<RoleLabels, Counter>::default();
        registry.register(
            "nodeup_selection_timeouts",
            "Total number of selected nodes that missed the completion deadline",
            selection_timeouts_total.clone(),
        );

        let selection_wait_seconds = Family::<RoleLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(SELECTION_WAIT_BUCKETS.iter().copied())
        });
        registry.register(
            "nodeup_selection_wait_seconds",
            "Time from selecting a node until it reports the target versions",
            selection_wait_seconds.clone(),
        );

        Self {
            reconcile_total,
            node_selections_total,
            selection_timeouts_total,
            selection_wait_seconds,
        }
    }

    pub fn record_reconcile(&self, result: &str) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(port, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_labels() {
        assert_eq!(RoleLabels::new(true).role, "control-plane");
        assert_eq!(RoleLabels::new(false).role, "worker");
    }

    #[test]
    fn test_metrics_encoding() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);

        metrics.record_reconcile("advanced");
        metrics
            .node_selections_total
            .get_or_create(&RoleLabels::new(false))
            .inc();
        metrics
            .selection_wait_seconds
            .get_or_create(&RoleLabels::new(true))
            .observe(42.0);

        let mut buf = String::new();
        encode(&mut buf, &registry).unwrap();
        assert!(buf.contains("nodeup_reconcile_total{result=\"advanced\"} 1"));
        assert!(buf.contains("nodeup_node_selections_total{role=\"worker\"} 1"));
        assert!(buf.contains("nodeup_selection_wait_seconds_count{role=\"control-plane\"} 1"));
    }
}
