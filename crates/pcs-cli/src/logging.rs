use anyhow::{Context, Result};
use pcs_sync::SyncConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// `RUST_LOG` wins over the configured level. Logs go to stderr so command
/// output on stdout stays clean.
pub fn init_subscriber(config: &SyncConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let json = config
        .log_json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let pretty = (!config.log_json).then(|| fmt::layer().with_writer(std::io::stderr));

    let subscriber = Registry::default().with(filter).with(json).with(pretty);

    tracing::subscriber::set_global_default(subscriber)
        .context("installing global tracing subscriber")
}
