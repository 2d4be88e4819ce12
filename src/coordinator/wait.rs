//! Bounded wait for one selected node to report the target versions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crd::UpgradeSpec;
use crate::error::{NodeupError, Result};
use crate::store::NodeStore;

#[derive(Clone, Copy, Debug)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Wait until `node` no longer needs an upgrade, or fail after `settings.timeout`.
///
/// A background checker re-reads the node on every tick and fires a one-shot
/// signal once its versions match. The checker is cancelled when this
/// returns or when the calling future is dropped.
pub async fn wait_for_completion(
    store: Arc<dyn NodeStore>,
    node: &str,
    spec: &UpgradeSpec,
    settings: WaitSettings,
) -> Result<()> {
    let token = CancellationToken::new();
    let _stop = token.clone().drop_guard();
    let (done_tx, done_rx) = oneshot::channel();

    let checker = tokio::spawn(poll_until_current(
        store,
        node.to_string(),
        spec.clone(),
        settings.poll_interval,
        token.clone(),
        done_tx,
    ));

    let outcome = tokio::time::timeout(settings.timeout, done_rx).await;
    token.cancel();
    checker.abort();

    match outcome {
        Ok(Ok(())) => Ok(()),
        _ => Err(NodeupError::SelectionTimeout {
            node: node.to_string(),
            timeout: settings.timeout,
        }),
    }
}

async fn poll_until_current(
    store: Arc<dyn NodeStore>,
    node: String,
    spec: UpgradeSpec,
    interval: Duration,
    token: CancellationToken,
    done: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.get(&node).await {
            Ok(record) if !record.needs_upgrade(&spec) => {
                debug!(node = %node, "Node reports target versions");
                let _ = done.send(());
                return;
            }
            Ok(record) => debug!(
                node = %node,
                kubelet_version = %record.status.kubelet_version,
                os_image = %record.status.os_image,
                "Node still upgrading"
            ),
            Err(e) => warn!(node = %node, error = %e, "Failed to read node while waiting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryNodeStore, worker};

    fn target() -> UpgradeSpec {
        UpgradeSpec {
            kube_version: "v1.29.1".to_string(),
            ..Default::default()
        }
    }

    fn settings() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_when_versions_change() {
        let store = Arc::new(MemoryNodeStore::with_nodes(vec![worker("w1", "v1.28.0")]));
        let dyn_store: Arc<dyn NodeStore> = store.clone();

        let handle = tokio::spawn(async move {
            wait_for_completion(dyn_store, "w1", &target(), settings()).await
        });
        tokio::time::sleep(Duration::from_secs(12)).await;
        store.set_versions("w1", "v1.29.1");

        let started = tokio::time::Instant::now();
        handle.await.unwrap().unwrap();
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_node_is_stuck() {
        let store: Arc<dyn NodeStore> =
            Arc::new(MemoryNodeStore::with_nodes(vec![worker("w1", "v1.28.0")]));

        let started = tokio::time::Instant::now();
        let err = wait_for_completion(store, "w1", &target(), settings())
            .await
            .unwrap_err();

        assert!(matches!(err, NodeupError::SelectionTimeout { ref node, .. } if node == "w1"));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_current_returns_on_first_tick() {
        let store: Arc<dyn NodeStore> =
            Arc::new(MemoryNodeStore::with_nodes(vec![worker("w1", "v1.29.1")]));

        let started = tokio::time::Instant::now();
        wait_for_completion(store, "w1", &target(), settings())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_node_times_out() {
        let store: Arc<dyn NodeStore> = Arc::new(MemoryNodeStore::default());

        let err = wait_for_completion(store, "gone", &target(), settings())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeupError::SelectionTimeout { .. }));
    }
}
