//! Tracing initialization.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the global subscriber.
///
/// `RUST_LOG` takes precedence. Otherwise `level` is used, then the
/// `LOG_LEVEL` environment variable, then `info`.
pub fn init_tracing(level: Option<&str>) {
    let fallback = level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .map(|level| level.to_lowercase())
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
