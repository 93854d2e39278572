use anyhow::{Context, Result};

use apollo::gateway::{self, GatewayConfig};

pub async fn run(
    addr: String,
    default_heartbeat_seconds: u64,
    stale_multiplier: u64,
    device_token: Option<String>,
    device_token_secret: Option<String>,
) -> Result<()> {
    let addr = addr.parse().with_context(|| format!("invalid --addr: {addr}"))?;
    gateway::run(GatewayConfig {
        addr,
        default_heartbeat_seconds,
        stale_multiplier,
        device_token,
        device_token_secret,
    })
    .await
}
