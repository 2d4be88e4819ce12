//! `nodeup proxy`: watches its own node and forwards the active `Upgrade`
//! to the host agent once the node is selected.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, warn};

use super::{action_for_error, action_for_forward};
use crate::config::ProxyArgs;
use crate::crd::{Upgrade, active_upgrade};
use crate::error::NodeupError;
use crate::forwarder::Forwarder;
use crate::health::{self, HealthState};
use crate::node::NodeRecord;
use crate::rpc::client::AgentClient;
use crate::store::KubeNodeStore;

pub struct Context {
    pub forwarder: Forwarder,
    pub upgrades: Api<Upgrade>,
}

pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, NodeupError> {
    let record = NodeRecord::from(node.as_ref());
    if record.name != ctx.forwarder.node_name() {
        debug!(node = %record.name, "Ignoring foreign node");
        return Ok(Action::await_change());
    }

    let upgrades = ctx.upgrades.list(&ListParams::default()).await?;
    let Some(active) = active_upgrade(&upgrades.items) else {
        debug!(node = %record.name, "No Upgrade found");
        return Ok(Action::await_change());
    };

    let outcome = ctx.forwarder.sync_node(&record, &active.spec).await?;
    debug!(node = %record.name, upgrade = %active.name_any(), ?outcome, "Node synced");
    Ok(action_for_forward(&outcome))
}

pub fn error_policy(node: Arc<Node>, err: &NodeupError, _ctx: Arc<Context>) -> Action {
    error!(node = %node.name_any(), error = %err, "Forwarding failed");
    action_for_error(err)
}

pub async fn run(args: ProxyArgs) -> anyhow::Result<()> {
    args.display();

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let health_state = HealthState::new();
    let health_port = args.health_port;
    let health_server = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_server).await {
            error!(error = %e, "Health server failed");
        }
    });

    let nodes: Api<Node> = Api::all(client.clone());
    let upgrades: Api<Upgrade> = Api::all(client.clone());

    let forwarder = Forwarder::new(
        args.node_name.clone(),
        Arc::new(KubeNodeStore::new(client)),
        Arc::new(AgentClient::new(args.socket_path.clone(), args.rpc_timeout())),
    );
    let ctx = Arc::new(Context {
        forwarder,
        upgrades: upgrades.clone(),
    });

    let own_node = ObjectRef::<Node>::new(&args.node_name);
    let node_selector = format!("metadata.name={}", args.node_name);

    health_state.set_ready(true);

    info!(node = %args.node_name, "Starting node controller");
    Controller::new(nodes, watcher::Config::default().fields(&node_selector))
        .watches(upgrades, watcher::Config::default(), move |_upgrade: Upgrade| {
            Some(own_node.clone())
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(node = %obj.name, ?action, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconcile failed"),
            }
        })
        .await;

    info!("Proxy stopped");
    Ok(())
}
