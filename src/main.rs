use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use admission_governor::config::ServiceConfig;
use admission_governor::middleware::GovernorServer;

/// Per-identity admission governor for HTTP services.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Service configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy document, overriding `governor.policy_path`
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Listen address, overriding `server.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Validate the policy document and exit
    #[arg(long)]
    check: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Admission Governor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(policy) = args.policy {
        config.governor.policy_path = Some(policy);
    }
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    // A policy that fails to load is fatal; never serve without one.
    let governor = config.load_governor()?;
    for rule in governor.catalog().rules() {
        info!(
            rule = %rule.name(),
            soft_limit = rule.soft_limit(),
            hard_limit = rule.hard_limit(),
            period_secs = rule.period().as_secs(),
            target_per_sec = rule.target(),
            "Rule loaded"
        );
    }

    if args.check {
        info!(rules = governor.catalog().len(), "Policy document is valid");
        return Ok(());
    }

    let server = GovernorServer::new(config.server.listen_addr, Arc::new(governor))
        .with_identity_header(config.identity_header()?);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Admission Governor stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_defaults_to_text() {
        let args = Args::try_parse_from(["admission-governor"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_log_format_json() {
        let args =
            Args::try_parse_from(["admission-governor", "--log-format", "json", "--check"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(args.check);

        assert!(Args::try_parse_from(["admission-governor", "--log-format", "xml"]).is_err());
    }
}
