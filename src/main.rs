use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use kube::CustomResourceExt;
use tracing::{error, info, warn};

use nodeup::agent::UpgradeAgent;
use nodeup::agent::commands::SystemRunner;
use nodeup::config::{AgentArgs, Command, Config};
use nodeup::controller::{operator, proxy};
use nodeup::crd::Upgrade;
use nodeup::logging;
use nodeup::rpc::server;

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    // Printed YAML must stay free of log lines.
    if matches!(config.command, Command::Crd) {
        if let Err(e) = print_crd() {
            eprintln!("Failed to render CRD: {e}");
            std::process::exit(1);
        }
        return;
    }

    logging::init(config.log_format, &config.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = config.command.name(),
        "Starting nodeup"
    );

    let result = match config.command {
        Command::Operator(args) => operator::run(args).await,
        Command::Proxy(args) => proxy::run(args).await,
        Command::Agent(args) => run_agent(args).await,
        Command::Crd => Ok(()),
    };

    if let Err(e) = result {
        error!(error = %e, "nodeup failed");
        std::process::exit(1);
    }
}

fn print_crd() -> Result<()> {
    print!("{}", serde_yaml::to_string(&Upgrade::crd())?);
    Ok(())
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    args.display();

    let listener = server::bind(&args.socket_path, Some(args.socket_group_id))?;
    let agent = Arc::new(UpgradeAgent::new(
        Arc::new(SystemRunner),
        args.agent_settings(),
    ));

    server::serve(listener, agent, shutdown_signal()).await;

    remove_socket(&args.socket_path);
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            None
        }
    };

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for SIGINT");
                std::future::pending::<()>().await;
            }
        }
        () = async {
            match terminate.as_mut() {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {}
    }
    info!("Received SIGINT/SIGTERM, shutting down");
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(socket = %path.display(), error = %e, "Failed to remove agent socket");
    }
}
