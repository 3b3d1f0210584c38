use crate::config::ClientConfig;
use crate::error::AppError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber. `AUCTION_LOG` wins over the
/// configured filter when set.
pub fn init_logging(config: &ClientConfig) -> Result<(), AppError> {
    let filter = EnvFilter::try_from_env("AUCTION_LOG")
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|error| AppError::Logging(error.to_string()))?;

    let result = if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };

    result.map_err(|error| AppError::Logging(error.to_string()))
}
