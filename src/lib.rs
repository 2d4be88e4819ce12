//! nodeup: rolling OS and Kubernetes version upgrades for kubeadm clusters.
//!
//! An `Upgrade` object names the target OS image and Kubernetes version. The
//! operator selects nodes one tier at a time (control plane first, then
//! workers in throttled batches), a per-node proxy forwards the target to the
//! privileged host agent, and the agent performs the rebase or kubeadm
//! upgrade.

pub mod agent;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod crd;
pub mod error;
pub mod forwarder;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod rpc;
pub mod store;
