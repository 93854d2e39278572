mod cli;
mod commands;

use clap::Parser;
use cli::{AgentAction, Cli, Commands, ControllerAction, CrdAction, GatewayAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run().await?,
        Commands::Controller { action: ControllerAction::Run { metrics_addr } } => {
            commands::controller::run(metrics_addr).await?
        }
        Commands::Gateway {
            action:
                GatewayAction::Serve {
                    addr,
                    default_heartbeat_seconds,
                    stale_multiplier,
                    device_token,
                    device_token_secret,
                },
        } => {
            commands::gateway::run(
                addr,
                default_heartbeat_seconds,
                stale_multiplier,
                device_token,
                device_token_secret,
            )
            .await?
        }
        Commands::Agent {
            action:
                AgentAction::Run {
                    device_name,
                    gateway_url,
                    device_token,
                    device_token_secret,
                    state_file,
                    unit_dir,
                    env_dir,
                    oci_cache_root,
                    oci_plain_http,
                    oci_plain_http_hosts,
                },
        } => {
            commands::agent::run(commands::agent::AgentArgs {
                device_name,
                gateway_url,
                device_token,
                device_token_secret,
                state_file,
                unit_dir,
                env_dir,
                oci_cache_root,
                oci_plain_http,
                oci_plain_http_hosts,
            })
            .await?
        }
        Commands::Crd { action: CrdAction::Generate } => commands::crd::generate()?,
        Commands::Crd { action: CrdAction::Install } => commands::crd::install().await?,
    }

    Ok(())
}
