//! Electric migrations proxy
//!
//! A transparent PostgreSQL wire-protocol proxy that sits between
//! migration tooling and the upstream database. Ordinary SQL passes
//! through untouched; DDL on electrified tables and the `ELECTRIC …`
//! command vocabulary are intercepted, compiled and executed with the
//! bookkeeping the replication pipeline depends on.

mod ddlx;
mod injector;
mod parser;
mod permissions;
mod schema;
mod server;
mod session;
mod telemetry;
mod upstream;
mod wire;

use clap::Parser;
use tracing::info;

use electric_common::config::ProxyConfig;

use crate::server::ProxyServer;

#[derive(Parser, Debug)]
#[command(name = "electric-proxy")]
#[command(about = "Transparent PostgreSQL proxy for Electric migrations")]
struct Args {
    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(report) => {
            eprintln!("{report}");
            std::process::exit(1);
        }
    };

    telemetry::init(&args.log_level, config.tracing_enabled)?;

    info!("Starting Electric migrations proxy");
    info!("  listen: {:?}", config.listen);
    info!("  upstream: {}", config.upstream_addr);
    info!("  query timeout: {}s", config.query_timeout_secs);

    let server = ProxyServer::new(config);

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
