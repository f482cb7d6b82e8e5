//! Logging setup

use std::sync::OnceLock;

/// Global flag for verbose logging
static VERBOSE_LOGGING: OnceLock<bool> = OnceLock::new();

/// Check if verbose logging is enabled
pub fn is_verbose() -> bool {
    VERBOSE_LOGGING.get().copied().unwrap_or(false)
}

/// Install the tracing subscriber and remember the verbose flag.
///
/// `RUST_LOG` takes precedence; otherwise the level is INFO. The verbose
/// flag controls how much per-service detail is logged, not the level.
pub fn init_logging(verbose: bool) {
    VERBOSE_LOGGING.set(verbose).ok();

    let result = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .try_init()
    };

    // a second init (tests, embedding) keeps the first subscriber
    if let Err(e) = result {
        tracing::debug!("Tracing subscriber already installed: {}", e);
    }
}
