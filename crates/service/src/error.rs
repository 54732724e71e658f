use sigbroker::BrokerError;
use thiserror::Error;

/// Errors that stop the service from starting or serving.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("signing gateway client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
