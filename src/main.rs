use anyhow::Context;
use gatekeeper::{config::GatewayConfig, init_gateway, init_tracing, shutdown_telemetry};
use std::env;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.yaml".to_string());

    let config = GatewayConfig::from_file(&config_path).with_context(|| {
        format!(
            "Failed to load configuration from {} (usage: gatekeeper [config_file])",
            config_path
        )
    })?;

    init_tracing(config.server.log_format, config.telemetry.as_ref())
        .context("Failed to initialize tracing")?;

    let result = init_gateway(config, Some(PathBuf::from(&config_path))).await;
    shutdown_telemetry();

    result.context("Gateway error")
}
