use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset. Upstream HTTP clients are noisy at
/// `info`, so they are held to warnings.
pub const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,reqwest=warn";

pub type LoggingError = Box<dyn std::error::Error + Send + Sync>;

/// Install the global subscriber, once, before the engine is built.
pub fn init_logging() {
    if let Err(err) = try_init_logging(DEFAULT_DIRECTIVES) {
        eprintln!("logging already initialized: {}", err);
    }
}

/// `RUST_LOG` wins over `directives`. Fails if a global subscriber is
/// already set.
pub fn try_init_logging(directives: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()?;

    info!(directives, "Logging initialized");
    Ok(())
}
