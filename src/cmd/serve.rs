//! HTTP server command: `uplift serve`.

use anyhow::Result;
use uplift::config::UpliftConfig;

pub async fn cmd_serve(config: UpliftConfig) -> Result<()> {
    if config.detector.command.is_empty() {
        tracing::warn!("no detector command configured; every update will fail at detection");
    }
    uplift::update::server::start_server(config).await
}
