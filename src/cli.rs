use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "apollo")]
#[command(about = "Device fleet control plane: fan-out controller, device gateway, and on-device agent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Run the DeviceProcessDeployment fan-out controller
    Controller {
        #[command(subcommand)]
        action: ControllerAction,
    },

    /// Run the device gateway HTTP server
    Gateway {
        #[command(subcommand)]
        action: GatewayAction,
    },

    /// Run the on-device agent reconciliation loop
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Manage the Device/DeviceProcess/DeviceProcessDeployment CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },
}

#[derive(Subcommand)]
pub enum ControllerAction {
    /// Start the fan-out reconciliation loop
    Run {
        /// Address the health/readiness/metrics server listens on
        #[arg(long, env = "APOLLO_CONTROLLER_METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,
    },
}

#[derive(Subcommand)]
pub enum GatewayAction {
    /// Start the device gateway HTTP server
    Serve {
        #[arg(long, env = "APOLLO_GATEWAY_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        #[arg(long, env = "APOLLO_GATEWAY_DEFAULT_HEARTBEAT_SECONDS", default_value_t = 15)]
        default_heartbeat_seconds: u64,

        #[arg(long, env = "APOLLO_GATEWAY_STALE_MULTIPLIER", default_value_t = 3)]
        stale_multiplier: u64,

        #[arg(long, env = "APOLLO_DEVICE_TOKEN")]
        device_token: Option<String>,

        #[arg(long, env = "APOLLO_DEVICE_TOKEN_SECRET")]
        device_token_secret: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum AgentAction {
    /// Start the on-device reconciliation loop
    Run {
        #[arg(long, env = "APOLLO_DEVICE_NAME")]
        device_name: String,

        #[arg(long, env = "APOLLO_GATEWAY_URL")]
        gateway_url: String,

        #[arg(long, env = "APOLLO_DEVICE_TOKEN")]
        device_token: Option<String>,

        #[arg(long, env = "APOLLO_DEVICE_TOKEN_SECRET")]
        device_token_secret: Option<String>,

        #[arg(long, env = "APOLLO_AGENT_STATE_FILE", default_value = "/var/lib/apollo/agent/state.json")]
        state_file: String,

        #[arg(long, env = "APOLLO_UNIT_DIR", default_value = "/etc/systemd/system")]
        unit_dir: String,

        #[arg(long, env = "APOLLO_ENV_DIR", default_value = "/etc/apollo/env")]
        env_dir: String,

        #[arg(long, env = "APOLLO_OCI_CACHE_ROOT", default_value = "/var/lib/apollo/artifacts/oci")]
        oci_cache_root: String,

        /// Allow plain HTTP for every OCI registry
        #[arg(long, env = "APOLLO_OCI_PLAIN_HTTP")]
        oci_plain_http: bool,

        /// Comma-separated hosts to allow plain HTTP for, even when the global flag is off
        #[arg(long, env = "APOLLO_OCI_PLAIN_HTTP_HOSTS")]
        oci_plain_http_hosts: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML for Device, DeviceProcess, and DeviceProcessDeployment to stdout
    Generate,

    /// Install all three CRDs into the connected cluster
    Install,
}
