//! `nodeup operator`: one coordinator pass per reconcile of the active `Upgrade`.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use prometheus_client::registry::Registry;
use tracing::{debug, error, info, warn};

use super::{action_for_error, action_for_pass, outcome_label};
use crate::config::OperatorArgs;
use crate::coordinator::{Coordinator, PassOutcome};
use crate::crd::{Upgrade, active_upgrade};
use crate::error::NodeupError;
use crate::health::{self, HealthState};
use crate::metrics::{self, Metrics};
use crate::store::KubeNodeStore;

pub struct Context {
    pub coordinator: Coordinator,
    /// Reflector cache of every `Upgrade`, used to find the active one.
    pub upgrades: Store<Upgrade>,
    pub metrics: Arc<Metrics>,
}

pub async fn reconcile(obj: Arc<Upgrade>, ctx: Arc<Context>) -> Result<Action, NodeupError> {
    let name = obj.name_any();

    let upgrades = ctx.upgrades.state();
    if let Some(active) = active_upgrade(upgrades.iter().map(|u| &**u))
        && active.name_any() != name
    {
        warn!(
            upgrade = %name,
            active = %active.name_any(),
            "Another Upgrade drives the rollout, ignoring"
        );
        ctx.metrics.record_reconcile("ignored");
        return Ok(Action::await_change());
    }

    debug!(
        upgrade = %name,
        os_version = %obj.spec.os_version,
        kube_version = %obj.spec.kube_version,
        "Running coordinator pass"
    );
    let outcome = ctx.coordinator.pass(&obj.spec).await?;
    ctx.metrics.record_reconcile(outcome_label(&outcome));

    match &outcome {
        PassOutcome::Advanced { selected } => {
            info!(upgrade = %name, ?selected, "Rollout advanced");
        }
        PassOutcome::Stalled { node } => {
            warn!(upgrade = %name, node = %node, "Rollout stalled on node");
        }
        PassOutcome::Steady => debug!(upgrade = %name, "Cluster at target versions"),
        PassOutcome::NoTarget => {}
    }

    Ok(action_for_pass(&outcome))
}

pub fn error_policy(obj: Arc<Upgrade>, err: &NodeupError, ctx: Arc<Context>) -> Action {
    ctx.metrics.record_reconcile("error");
    error!(upgrade = %obj.name_any(), error = %err, "Reconcile failed");
    action_for_error(err)
}

pub async fn run(args: OperatorArgs) -> anyhow::Result<()> {
    args.display();

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = Registry::default();
    let metrics = Arc::new(Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = HealthState::new();
    let health_port = args.health_port;
    let health_server = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_server).await {
            error!(error = %e, "Health server failed");
        }
    });

    let metrics_port = args.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    let upgrades: Api<Upgrade> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());

    let controller = Controller::new(upgrades, watcher::Config::default());
    let store = controller.store();
    let ctx = Arc::new(Context {
        coordinator: Coordinator::new(
            Arc::new(KubeNodeStore::new(client)),
            args.coordinator_settings(),
            metrics.clone(),
        ),
        upgrades: store.clone(),
        metrics,
    });

    health_state.set_ready(true);

    info!("Starting Upgrade controller");
    controller
        .watches(nodes, watcher::Config::default(), move |_node: Node| {
            store
                .state()
                .iter()
                .map(|u| ObjectRef::from_obj(&**u))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(upgrade = %obj.name, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        })
        .await;

    info!("Operator stopped");
    Ok(())
}
