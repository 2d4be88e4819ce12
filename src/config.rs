use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::agent::{AgentSettings, DEFAULT_OS_RELEASE_PATH, DEFAULT_STAMP_DIR};
use crate::coordinator::CoordinatorSettings;
use crate::rpc::DEFAULT_SOCKET_PATH;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "nodeup",
    version,
    about = "Rolling OS and Kubernetes upgrades for kubeadm clusters"
)]
pub struct Config {
    /// Log format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json", global = true)]
    pub log_format: LogFormat,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[value(alias = "compact", alias = "text")]
    Pretty,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the cluster-wide rollout coordinator
    Operator(OperatorArgs),
    /// Run the per-node forwarder (DaemonSet)
    Proxy(ProxyArgs),
    /// Run the privileged host agent
    Agent(AgentArgs),
    /// Print the Upgrade CustomResourceDefinition as YAML
    Crd,
}

impl Command {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Operator(_) => "operator",
            Self::Proxy(_) => "proxy",
            Self::Agent(_) => "agent",
            Self::Crd => "crd",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Seconds between reads of a selected node
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value = "5")]
    pub poll_interval_seconds: u64,

    /// Seconds a selected node may take to reach the target versions
    #[arg(long, env = "COMPLETION_TIMEOUT_SECONDS", default_value = "600")]
    pub completion_timeout_seconds: u64,

    /// Worker batch size when the Upgrade leaves maxUnavailable unset
    #[arg(long, env = "DEFAULT_MAX_UNAVAILABLE", default_value = "2")]
    pub default_max_unavailable: usize,

    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,
}

impl OperatorArgs {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_seconds.max(1)),
            completion_timeout: Duration::from_secs(self.completion_timeout_seconds.max(1)),
            default_max_unavailable: self.default_max_unavailable.max(1),
        }
    }

    pub fn display(&self) {
        tracing::info!(
            poll_interval_seconds = self.poll_interval_seconds,
            completion_timeout_seconds = self.completion_timeout_seconds,
            default_max_unavailable = self.default_max_unavailable,
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            "Operator configuration initialized"
        );
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Name of the node this proxy runs on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Agent socket path on the host
    #[arg(long, env = "AGENT_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket_path: PathBuf,

    /// Seconds to wait for the agent to answer one request
    #[arg(long, env = "RPC_TIMEOUT_SECONDS", default_value = "1800")]
    pub rpc_timeout_seconds: u64,

    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,
}

impl ProxyArgs {
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_seconds)
    }

    pub fn display(&self) {
        tracing::info!(
            node = %self.node_name,
            socket = %self.socket_path.display(),
            rpc_timeout_seconds = self.rpc_timeout_seconds,
            health_port = self.health_port,
            "Proxy configuration initialized"
        );
    }
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    #[arg(long, env = "AGENT_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub socket_path: PathBuf,

    /// Group that may connect to the socket
    #[arg(long, env = "SOCKET_GROUP_ID", default_value = "0")]
    pub socket_group_id: u32,

    /// Directory for per-version kubeadm completion stamps
    #[arg(long, env = "STAMP_DIR", default_value = DEFAULT_STAMP_DIR)]
    pub stamp_dir: PathBuf,

    #[arg(long, env = "OS_RELEASE_PATH", default_value = DEFAULT_OS_RELEASE_PATH)]
    pub os_release_path: PathBuf,
}

impl AgentArgs {
    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            stamp_dir: self.stamp_dir.clone(),
            os_release_path: self.os_release_path.clone(),
        }
    }

    pub fn display(&self) {
        tracing::info!(
            socket = %self.socket_path.display(),
            socket_group_id = self.socket_group_id,
            stamp_dir = %self.stamp_dir.display(),
            os_release_path = %self.os_release_path.display(),
            "Agent configuration initialized"
        );
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_defaults() {
        let config = Config::try_parse_from(["nodeup", "operator"]).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "info");

        let Command::Operator(args) = config.command else {
            panic!("expected operator command");
        };
        let settings = args.coordinator_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.completion_timeout, Duration::from_secs(600));
        assert_eq!(settings.default_max_unavailable, 2);
        assert_eq!(args.health_port, 8080);
        assert_eq!(args.metrics_port, 8081);
    }

    #[test]
    fn test_operator_zero_values_are_clamped() {
        let config = Config::try_parse_from([
            "nodeup",
            "operator",
            "--poll-interval-seconds",
            "0",
            "--completion-timeout-seconds",
            "0",
            "--default-max-unavailable",
            "0",
        ])
        .unwrap();
        let Command::Operator(args) = config.command else {
            panic!("expected operator command");
        };
        let settings = args.coordinator_settings();
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.completion_timeout, Duration::from_secs(1));
        assert_eq!(settings.default_max_unavailable, 1);
    }

    #[test]
    fn test_proxy_requires_node_name() {
        let result = Config::try_parse_from(["nodeup", "proxy"]);
        // NODE_NAME may be set in the test environment
        if std::env::var_os("NODE_NAME").is_none() {
            assert!(result.is_err());
        }

        let config =
            Config::try_parse_from(["nodeup", "proxy", "--node-name", "worker-1"]).unwrap();
        let Command::Proxy(args) = config.command else {
            panic!("expected proxy command");
        };
        assert_eq!(args.node_name, "worker-1");
        assert_eq!(args.socket_path, PathBuf::from("/run/nodeup/agent.sock"));
        assert_eq!(args.rpc_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_agent_settings() {
        let config = Config::try_parse_from([
            "nodeup",
            "--log-format",
            "pretty",
            "agent",
            "--stamp-dir",
            "/tmp/stamps",
            "--socket-group-id",
            "992",
        ])
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);

        let Command::Agent(args) = config.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.socket_group_id, 992);
        let settings = args.agent_settings();
        assert_eq!(settings.stamp_dir, PathBuf::from("/tmp/stamps"));
        assert_eq!(settings.os_release_path, PathBuf::from("/etc/os-release"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let config =
            Config::try_parse_from(["nodeup", "crd", "--log-format", "text"]).unwrap();
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.command.name(), "crd");
    }
}
