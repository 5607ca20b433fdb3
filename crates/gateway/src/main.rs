use anyhow::Context;
use clap::Parser;
use gateway::logging::{init_logging, LogArgs};
use gateway::runtime::GatewayRuntime;
use gateway::GatewayConfig;

/// Streaming gateway of an executor topology: accepts document requests,
/// fans them out across deployments, and streams responses back.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Gateway configuration as JSON. When omitted, the configuration is
    /// read from the GATEWAY_STREAMER_ARGS environment variable.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<String>,

    /// Address serving the readiness probe and prometheus metrics.
    #[arg(long, default_value = "0.0.0.0:9090", env = "GATEWAY_HEALTH_ADDRESS")]
    health_address: String,

    #[command(flatten)]
    log_args: LogArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_args);

    let config = match &cli.config {
        Some(raw) => GatewayConfig::from_json(raw).context("parsing --config")?,
        None => GatewayConfig::from_env().context("reading gateway configuration")?,
    };

    let runtime = GatewayRuntime::new(config);

    let listener = tokio::net::TcpListener::bind(&cli.health_address)
        .await
        .with_context(|| format!("binding health address {}", cli.health_address))?;
    tracing::info!(address = %cli.health_address, "serving readiness probe and metrics");
    let router = runtime.router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "health server failed");
        }
    });

    runtime.run().await
}
