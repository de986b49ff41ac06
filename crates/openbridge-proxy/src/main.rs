//! `openbridge` binary entrypoint.

use std::path::PathBuf;

use clap::Parser;
use openbridge_proxy::{serve, BackendKind, ProxyConfig};

#[derive(Parser)]
#[command(name = "openbridge")]
#[command(version, about = "OpenAI-compatible proxy for the Messages API and the claude CLI", long_about = None)]
struct Cli {
    /// YAML config file (overrides OPENBRIDGE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Execution backend: `api` or `cli`
    #[arg(long)]
    backend: Option<BackendKind>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ProxyConfig::load_with(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    serve(config).await
}
