use std::path::PathBuf;

use anyhow::Result;

use apollo::agent::oci::OciConfig;
use apollo::agent::{self, AgentConfig};

pub struct AgentArgs {
    pub device_name: String,
    pub gateway_url: String,
    pub device_token: Option<String>,
    pub device_token_secret: Option<String>,
    pub state_file: String,
    pub unit_dir: String,
    pub env_dir: String,
    pub oci_cache_root: String,
    pub oci_plain_http: bool,
    pub oci_plain_http_hosts: Option<String>,
}

pub async fn run(args: AgentArgs) -> Result<()> {
    let plain_http_hosts = args
        .oci_plain_http_hosts
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect();

    let config = AgentConfig {
        device_name: args.device_name,
        gateway_url: args.gateway_url,
        device_token: args.device_token,
        device_token_secret: args.device_token_secret,
        state_path: PathBuf::from(args.state_file),
        unit_dir: PathBuf::from(args.unit_dir),
        env_dir: PathBuf::from(args.env_dir),
        oci: OciConfig {
            cache_root: PathBuf::from(args.oci_cache_root),
            plain_http: args.oci_plain_http,
            plain_http_hosts,
            ..Default::default()
        },
    };

    agent::run(config).await
}
