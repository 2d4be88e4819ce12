//! Node view used by both control loops: markers, reported versions and the
//! version-mismatch predicate.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Node;

use crate::crd::UpgradeSpec;

/// Role label carried by control-plane nodes.
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Set by the coordinator when a node should upgrade now; cleared by the proxy.
/// The value names the target the node was selected for, see [`selection_value`].
pub const SELECTED_LABEL: &str = "nodeup.io/upgrading";

/// Prefix of the per-version completion label.
pub const COMPLETED_LABEL_PREFIX: &str = "nodeup.io/completed-";

pub const MARKER_VALUE: &str = "true";

/// Maximum length of a label value and of the name segment of a label key.
const LABEL_NAME_MAX: usize = 63;

/// Versions reported by the kubelet in the node status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStatusSnapshot {
    pub os_image: String,
    pub kubelet_version: String,
    pub kube_proxy_version: String,
    pub unschedulable: bool,
}

/// The parts of a `Node` this crate reads and writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    /// Observed `metadata.resourceVersion`; marker writes are conditioned on it.
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub status: NodeStatusSnapshot,
}

impl NodeRecord {
    pub fn is_control_plane(&self) -> bool {
        self.labels.contains_key(CONTROL_PLANE_LABEL)
    }

    /// Carries a selection marker, for any target.
    pub fn is_selected(&self) -> bool {
        self.labels.contains_key(SELECTED_LABEL)
    }

    /// Carries a selection marker for the target of `spec`.
    pub fn is_selected_for(&self, spec: &UpgradeSpec) -> bool {
        self.labels
            .get(SELECTED_LABEL)
            .is_some_and(|v| *v == selection_value(spec))
    }

    /// Carries a selection marker left over from a different target.
    pub fn has_stale_selection(&self, spec: &UpgradeSpec) -> bool {
        self.is_selected() && !self.is_selected_for(spec)
    }

    /// True while this node has not yet reached the desired versions.
    pub fn needs_upgrade(&self, spec: &UpgradeSpec) -> bool {
        version_mismatch(&self.status, spec)
    }
}

impl From<&Node> for NodeRecord {
    fn from(node: &Node) -> Self {
        let info = node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref());

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            resource_version: node.metadata.resource_version.clone(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            status: NodeStatusSnapshot {
                os_image: info.map(|i| i.os_image.clone()).unwrap_or_default(),
                kubelet_version: info.map(|i| i.kubelet_version.clone()).unwrap_or_default(),
                kube_proxy_version: info
                    .map(|i| i.kube_proxy_version.clone())
                    .unwrap_or_default(),
                unschedulable: node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false),
            },
        }
    }
}

/// Whether the reported versions differ from the desired ones.
///
/// A Kubernetes target takes precedence: the node matches only when both the
/// kubelet and kube-proxy report it. Without one, the OS image is compared.
pub fn version_mismatch(status: &NodeStatusSnapshot, spec: &UpgradeSpec) -> bool {
    if spec.kube_version.is_empty() {
        spec.os_version != status.os_image
    } else {
        spec.kube_version != status.kube_proxy_version
            || spec.kube_version != status.kubelet_version
    }
}

/// Value of [`SELECTED_LABEL`] for the target of `spec`: the Kubernetes
/// version when set, the OS version otherwise.
pub fn selection_value(spec: &UpgradeSpec) -> String {
    let target = if spec.kube_version.is_empty() {
        &spec.os_version
    } else {
        &spec.kube_version
    };
    label_safe(target, LABEL_NAME_MAX)
}

/// Label key recording that a node finished upgrading to `version`.
pub fn completed_label(version: &str) -> String {
    let segment = label_safe(version, LABEL_NAME_MAX - "completed-".len());
    format!("{COMPLETED_LABEL_PREFIX}{segment}")
}

/// Replace characters labels do not allow, cap the length and trim
/// non-alphanumeric ends.
fn label_safe(raw: &str, max: usize) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(max);
    out.trim_matches(|c: char| !c.is_ascii_alphanumeric()).to_string()
}
