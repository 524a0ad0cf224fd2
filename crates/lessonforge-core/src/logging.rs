use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, Registry};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Calling this twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = Registry::default().with(env_filter);

    match config.format.as_str() {
        "compact" => {
            let subscriber = registry.with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber).ok();
        }
        "full" => {
            let subscriber = registry.with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber).ok();
        }
        _ => {
            let subscriber = registry.with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber).ok();
        }
    }
}
