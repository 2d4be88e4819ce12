//! Host commands run by the agent.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{NodeupError, Result};

/// One subprocess invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Invocation {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Pull the image without signature verification and stage it for next boot.
pub fn rebase(image_url: &str) -> Invocation {
    let target = format!("ostree-unverified-registry:{image_url}");
    Invocation::new("rpm-ostree", &["rebase", "--experimental", &target])
}

pub fn reboot() -> Invocation {
    Invocation::new("systemctl", &["reboot"])
}

pub fn kubeadm_version() -> Invocation {
    Invocation::new("kubeadm", &["version", "-o", "short"])
}

pub fn restart_kubelet() -> Invocation {
    Invocation::new("systemctl", &["restart", "kubelet"])
}

/// Control-plane nodes run `upgrade apply`, workers `upgrade node`.
pub fn kubeadm_upgrade(kube_version: &str, control_plane: bool) -> Invocation {
    if control_plane {
        Invocation::new("kubeadm", &["upgrade", "apply", kube_version, "--yes"])
    } else {
        Invocation::new("kubeadm", &["upgrade", "node"])
    }
}

/// Runs host commands and returns their stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<String>;
}

/// [`CommandRunner`] that spawns real processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        debug!(command = %invocation, "Running command");

        let output = Command::new(invocation.program)
            .args(&invocation.args)
            .output()
            .await
            .map_err(|e| NodeupError::CommandFailed {
                command: invocation.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NodeupError::CommandFailed {
                command: invocation.to_string(),
                message: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Read `PRETTY_NAME` from an os-release file; this is what the kubelet reports as `osImage`.
pub async fn read_os_image(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_pretty_name(&content).unwrap_or_default())
}

fn parse_pretty_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix("PRETTY_NAME=")?;
        Some(value.trim_matches(|c| c == '"' || c == '\'').to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display() {
        assert_eq!(
            rebase("quay.io/fedora/fedora-coreos:40").to_string(),
            "rpm-ostree rebase --experimental ostree-unverified-registry:quay.io/fedora/fedora-coreos:40"
        );
        assert_eq!(
            kubeadm_upgrade("v1.29.1", true).to_string(),
            "kubeadm upgrade apply v1.29.1 --yes"
        );
        assert_eq!(kubeadm_upgrade("v1.29.1", false).to_string(), "kubeadm upgrade node");
    }

    #[test]
    fn test_parse_pretty_name() {
        let content = "NAME=\"Fedora Linux\"\nVERSION_ID=40\nPRETTY_NAME=\"Fedora CoreOS 40.20240416.3.1\"\n";
        assert_eq!(
            parse_pretty_name(content).as_deref(),
            Some("Fedora CoreOS 40.20240416.3.1")
        );
        assert_eq!(parse_pretty_name("NAME=x\n"), None);
    }

    #[tokio::test]
    async fn test_system_runner_reports_failure() {
        let err = SystemRunner
            .run(&Invocation::new("false", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeupError::CommandFailed { command, .. } if command == "false"));
    }

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let out = SystemRunner
            .run(&Invocation::new("echo", &["v1.29.1"]))
            .await
            .unwrap();
        assert_eq!(out.trim(), "v1.29.1");
    }
}
