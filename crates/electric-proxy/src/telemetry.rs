//! Logging setup
//!
//! tracing subscriber with env-filter; JSON output for production via
//! an environment toggle. Frame-level tracing is gated behind the
//! `PROXY_TRACING_ENABLE` configuration, which simply lowers the filter
//! for the wire modules.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(log_level: &str, frame_tracing: bool) -> Result<()> {
    let default_filter = if frame_tracing {
        format!("{log_level},electric_proxy::wire=trace,electric_proxy::injector=trace")
    } else {
        log_level.to_string()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let json_logs = std::env::var("JSON_LOGS")
        .map(|v| v == "true")
        .unwrap_or(false);

    let subscriber = tracing_subscriber::registry().with(filter);
    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(())
}
