//! `Upgrade` CRD type definition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `Upgrade` spec describes the target OS and Kubernetes versions of a rollout.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "nodeup.io",
    version = "v1alpha1",
    kind = "Upgrade",
    printcolumn = r#"{"name":"OS","type":"string","jsonPath":".spec.osVersion"}"#,
    printcolumn = r#"{"name":"KUBE","type":"string","jsonPath":".spec.kubeVersion"}"#,
    printcolumn = r#"{"name":"MAX","type":"integer","jsonPath":".spec.maxUnavailable"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    /// Target OS image name, as reported in the node's `osImage` (e.g., "Fedora CoreOS 40.20240416.3.1").
    #[serde(default)]
    pub os_version: String,

    /// OCI image reference the node is rebased onto.
    #[serde(default)]
    pub os_image_url: String,

    /// Target Kubernetes version (e.g., "v1.29.1").
    #[serde(default)]
    pub kube_version: String,

    /// Evict pods even when a disruption budget would block it.
    #[serde(default)]
    pub evict_pod_force: bool,

    /// Maximum number of worker nodes selected per pass (default applied when <= 0).
    #[serde(default)]
    pub max_unavailable: i64,
}

impl UpgradeSpec {
    /// True when neither an OS nor a Kubernetes target is set.
    pub const fn is_noop(&self) -> bool {
        self.os_version.is_empty() && self.kube_version.is_empty()
    }

    /// Worker throttle, falling back to `default` when unset or non-positive.
    pub fn effective_max_unavailable(&self, default: usize) -> usize {
        usize::try_from(self.max_unavailable)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(default)
    }
}

/// Pick the `Upgrade` that drives the rollout: the one with the lowest name.
pub fn active_upgrade<'a, I>(upgrades: I) -> Option<&'a Upgrade>
where
    I: IntoIterator<Item = &'a Upgrade>,
{
    upgrades
        .into_iter()
        .filter(|u| u.metadata.name.is_some())
        .min_by(|a, b| a.metadata.name.cmp(&b.metadata.name))
}
