use anyhow::{Context, Result};

use apollo::controller::{self, ControllerConfig};

pub async fn run(metrics_addr: String) -> Result<()> {
    let metrics_addr = metrics_addr
        .parse()
        .with_context(|| format!("invalid --metrics-addr: {metrics_addr}"))?;
    controller::run(ControllerConfig { metrics_addr }).await
}
