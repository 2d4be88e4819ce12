//! Node access for the control loops.
//!
//! All marker writes are conditioned on the node's `resourceVersion`; a
//! conflicting write is retried against a fresh read, never merged by hand.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube::api::{ListParams, Patch, PatchParams};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{NodeupError, Result};
use crate::node::NodeRecord;

/// Label key -> new value, `None` removes the label.
pub type LabelChanges = BTreeMap<String, Option<String>>;

/// Attempts for one logical marker update before giving up.
pub const MAX_CONFLICT_RETRIES: usize = 5;

const FIELD_MANAGER: &str = "nodeup";

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list(&self) -> Result<Vec<NodeRecord>>;

    async fn get(&self, name: &str) -> Result<NodeRecord>;

    /// Apply `changes` only if the node still has `node.resource_version`.
    /// Returns [`NodeupError::Conflict`] otherwise.
    async fn patch_labels(&self, node: &NodeRecord, changes: &LabelChanges) -> Result<()>;
}

/// Update labels on `node`, recomputing the change from a fresh read after a conflict.
///
/// `plan` returns the changes to make given the current node; an empty plan
/// means nothing is left to do. Returns whether a write happened.
pub async fn update_labels<F>(store: &dyn NodeStore, node: &NodeRecord, plan: F) -> Result<bool>
where
    F: Fn(&NodeRecord) -> LabelChanges + Send + Sync,
{
    let mut current = node.clone();
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let changes = plan(&current);
        if changes.is_empty() {
            return Ok(false);
        }
        match store.patch_labels(&current, &changes).await {
            Ok(()) => return Ok(true),
            Err(NodeupError::Conflict(_)) => {
                debug!(
                    node = %current.name,
                    attempt,
                    "Write conflict on node labels, re-reading"
                );
                current = store.get(&node.name).await?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(NodeupError::Conflict(node.name.clone()))
}

/// [`NodeStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeNodeStore {
    api: Api<Node>,
}

impl KubeNodeStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// Build the merge patch for a conditional label update.
fn label_patch(node: &NodeRecord, changes: &LabelChanges) -> Value {
    let labels: Map<String, Value> = changes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone().map_or(Value::Null, Value::String)))
        .collect();

    let mut metadata = json!({ "labels": labels });
    if let Some(rv) = &node.resource_version {
        metadata["resourceVersion"] = json!(rv);
    }
    json!({ "metadata": metadata })
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn list(&self) -> Result<Vec<NodeRecord>> {
        let nodes = self.api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(NodeRecord::from).collect())
    }

    async fn get(&self, name: &str) -> Result<NodeRecord> {
        match self.api.get_opt(name).await? {
            Some(node) => Ok(NodeRecord::from(&node)),
            None => Err(NodeupError::NodeNotFound(name.to_string())),
        }
    }

    async fn patch_labels(&self, node: &NodeRecord, changes: &LabelChanges) -> Result<()> {
        let patch = label_patch(node, changes);
        debug!(node = %node.name, ?changes, "Patching node labels");

        match self
            .api
            .patch(&node.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(NodeupError::Conflict(node.name.clone()))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(NodeupError::NodeNotFound(node.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory [`NodeStore`] that can simulate upgrades completing.

    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{LabelChanges, NodeStore};
    use crate::crd::UpgradeSpec;
    use crate::error::{NodeupError, Result};
    use crate::node::{CONTROL_PLANE_LABEL, NodeRecord, NodeStatusSnapshot, SELECTED_LABEL};

    #[derive(Default)]
    pub struct MemoryNodeStore {
        nodes: Mutex<BTreeMap<String, NodeRecord>>,
        /// When set, a selected node reaches these versions after the given number of reads.
        completion: Mutex<Option<(UpgradeSpec, usize)>>,
        pending: Mutex<HashMap<String, usize>>,
        selections: Mutex<Vec<String>>,
        patches: Mutex<Vec<(String, LabelChanges)>>,
        conflicts: Mutex<usize>,
    }

    pub fn worker(name: &str, kubelet: &str) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            resource_version: Some("1".to_string()),
            labels: BTreeMap::new(),
            status: NodeStatusSnapshot {
                os_image: "Fedora CoreOS 39".to_string(),
                kubelet_version: kubelet.to_string(),
                kube_proxy_version: kubelet.to_string(),
                unschedulable: false,
            },
        }
    }

    pub fn control_plane(name: &str, kubelet: &str) -> NodeRecord {
        let mut node = worker(name, kubelet);
        node.labels
            .insert(CONTROL_PLANE_LABEL.to_string(), String::new());
        node
    }

    impl MemoryNodeStore {
        pub fn with_nodes(nodes: Vec<NodeRecord>) -> Self {
            let store = Self::default();
            {
                let mut map = store.nodes.lock().unwrap();
                for node in nodes {
                    map.insert(node.name.clone(), node);
                }
            }
            store
        }

        /// Selected nodes report `spec`'s versions after `reads` further reads.
        pub fn complete_selected(self, spec: &UpgradeSpec, reads: usize) -> Self {
            *self.completion.lock().unwrap() = Some((spec.clone(), reads));
            self
        }

        /// Fail the next `n` patches with a conflict, as another writer would.
        pub fn inject_conflicts(&self, n: usize) {
            *self.conflicts.lock().unwrap() = n;
        }

        pub fn selections(&self) -> Vec<String> {
            self.selections.lock().unwrap().clone()
        }

        pub fn patches(&self) -> Vec<(String, LabelChanges)> {
            self.patches.lock().unwrap().clone()
        }

        pub fn node(&self, name: &str) -> NodeRecord {
            self.nodes.lock().unwrap()[name].clone()
        }

        pub fn selected_nodes(&self) -> Vec<String> {
            self.nodes
                .lock()
                .unwrap()
                .values()
                .filter(|n| n.is_selected())
                .map(|n| n.name.clone())
                .collect()
        }

        /// Nodes whose selection marker names the target of `spec`.
        pub fn selected_for(&self, spec: &UpgradeSpec) -> Vec<String> {
            self.nodes
                .lock()
                .unwrap()
                .values()
                .filter(|n| n.is_selected_for(spec))
                .map(|n| n.name.clone())
                .collect()
        }

        pub fn set_versions(&self, name: &str, kubelet: &str) {
            let mut nodes = self.nodes.lock().unwrap();
            if let Some(node) = nodes.get_mut(name) {
                node.status.kubelet_version = kubelet.to_string();
                node.status.kube_proxy_version = kubelet.to_string();
                bump(node);
            }
        }

        fn apply_completion(&self, node: &mut NodeRecord) {
            let completion = self.completion.lock().unwrap().clone();
            let Some((spec, _)) = completion else {
                return;
            };
            let mut pending = self.pending.lock().unwrap();
            let Some(remaining) = pending.get_mut(&node.name) else {
                return;
            };
            if *remaining > 0 {
                *remaining -= 1;
                return;
            }
            pending.remove(&node.name);
            if !spec.kube_version.is_empty() {
                node.status.kubelet_version.clone_from(&spec.kube_version);
                node.status.kube_proxy_version.clone_from(&spec.kube_version);
            }
            if !spec.os_version.is_empty() {
                node.status.os_image.clone_from(&spec.os_version);
            }
            bump(node);
        }
    }

    fn bump(node: &mut NodeRecord) {
        let next = node
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        node.resource_version = Some(next.to_string());
    }

    #[async_trait]
    impl NodeStore for MemoryNodeStore {
        async fn list(&self) -> Result<Vec<NodeRecord>> {
            Ok(self.nodes.lock().unwrap().values().cloned().collect())
        }

        async fn get(&self, name: &str) -> Result<NodeRecord> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| NodeupError::NodeNotFound(name.to_string()))?;
            self.apply_completion(node);
            Ok(node.clone())
        }

        async fn patch_labels(&self, node: &NodeRecord, changes: &LabelChanges) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let stored = nodes
                .get_mut(&node.name)
                .ok_or_else(|| NodeupError::NodeNotFound(node.name.clone()))?;

            {
                let mut conflicts = self.conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    bump(stored);
                    return Err(NodeupError::Conflict(node.name.clone()));
                }
            }
            if stored.resource_version != node.resource_version {
                return Err(NodeupError::Conflict(node.name.clone()));
            }

            for (key, value) in changes {
                match value {
                    Some(v) => {
                        if key == SELECTED_LABEL && stored.labels.get(key) != Some(v) {
                            self.selections.lock().unwrap().push(node.name.clone());
                            if let Some((_, reads)) = self.completion.lock().unwrap().as_ref() {
                                self.pending
                                    .lock()
                                    .unwrap()
                                    .insert(node.name.clone(), *reads);
                            }
                        }
                        stored.labels.insert(key.clone(), v.clone());
                    }
                    None => {
                        stored.labels.remove(key);
                    }
                }
            }
            bump(stored);
            self.patches
                .lock()
                .unwrap()
                .push((node.name.clone(), changes.clone()));
            Ok(())
        }
    }
}
