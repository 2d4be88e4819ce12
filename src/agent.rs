//! Node-local upgrade agent.
//!
//! Serves push requests from the proxy. Requests are fully serialized: an OS
//! rebase and a kubeadm upgrade must never run side by side on one node.

pub mod commands;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{NodeupError, Result};
use crate::rpc::PushRequest;
use crate::rpc::server::UpgradeHandler;
use commands::CommandRunner;

pub const DEFAULT_STAMP_DIR: &str = "/var/lib/nodeup";
pub const DEFAULT_OS_RELEASE_PATH: &str = "/etc/os-release";

/// Agent settings, built once at startup.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    /// Directory holding one stamp file per completed Kubernetes version.
    pub stamp_dir: PathBuf,
    pub os_release_path: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            stamp_dir: PathBuf::from(DEFAULT_STAMP_DIR),
            os_release_path: PathBuf::from(DEFAULT_OS_RELEASE_PATH),
        }
    }
}

pub struct UpgradeAgent {
    runner: Arc<dyn CommandRunner>,
    settings: AgentSettings,
    lock: Mutex<()>,
}

impl UpgradeAgent {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: AgentSettings) -> Self {
        Self {
            runner,
            settings,
            lock: Mutex::new(()),
        }
    }

    /// Stamp file marking `kube_version` as applied on this node.
    pub fn stamp_path(&self, kube_version: &str) -> PathBuf {
        let name = kube_version.replace(['/', '\\'], "_");
        self.settings
            .stamp_dir
            .join(format!("kubeadm-upgrade-{name}.done"))
    }

    /// Rebase onto the requested OS image and reboot.
    ///
    /// Returns true when a reboot was triggered; the caller learns about the
    /// outcome from the node's reported `osImage` once it is back.
    async fn upgrade_os(&self, request: &PushRequest) -> Result<bool> {
        let current = commands::read_os_image(&self.settings.os_release_path).await?;
        if current == request.os_version {
            info!(os_version = %current, "OS already at requested version, skipping rebase");
            return Ok(false);
        }
        if request.os_image_url.is_empty() {
            return Err(NodeupError::Protocol(format!(
                "OS version {} requested without an image URL",
                request.os_version
            )));
        }

        info!(
            from = %current,
            to = %request.os_version,
            image = %request.os_image_url,
            "Rebasing OS image"
        );
        self.runner
            .run(&commands::rebase(&request.os_image_url))
            .await?;

        warn!("OS rebase staged, rebooting node");
        self.runner.run(&commands::reboot()).await?;
        Ok(true)
    }

    async fn upgrade_kubernetes(&self, request: &PushRequest) -> Result<()> {
        let stamp = self.stamp_path(&request.kube_version);
        if tokio::fs::try_exists(&stamp).await? {
            info!(
                kube_version = %request.kube_version,
                stamp = %stamp.display(),
                "Kubernetes upgrade already applied, nothing to do"
            );
            return Ok(());
        }

        let installed = self.runner.run(&commands::kubeadm_version()).await?;
        let installed = installed.trim();
        if installed == request.kube_version {
            info!(
                kube_version = %installed,
                "kubeadm already at requested version, skipping apply"
            );
        } else {
            info!(
                from = %installed,
                to = %request.kube_version,
                control_plane = request.control_plane,
                "Applying Kubernetes upgrade"
            );
            self.runner.run(&commands::restart_kubelet()).await?;
            self.runner
                .run(&commands::kubeadm_upgrade(
                    &request.kube_version,
                    request.control_plane,
                ))
                .await?;
        }

        write_stamp(&stamp).await?;
        info!(kube_version = %request.kube_version, "Kubernetes upgrade completed");
        Ok(())
    }
}

async fn write_stamp(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, chrono::Utc::now().to_rfc3339()).await?;
    Ok(())
}

#[async_trait]
impl UpgradeHandler for UpgradeAgent {
    async fn upgrade(&self, request: &PushRequest) -> Result<()> {
        let _guard = self.lock.lock().await;
        info!(
            kube_version = %request.kube_version,
            os_version = %request.os_version,
            control_plane = request.control_plane,
            "Handling upgrade request"
        );

        if !request.os_version.is_empty() && self.upgrade_os(request).await? {
            return Ok(());
        }
        if !request.kube_version.is_empty() {
            self.upgrade_kubernetes(request).await?;
        }
        Ok(())
    }
}
