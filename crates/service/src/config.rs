//! Service configuration.
//!
//! Loaded from the JSON file named by `SIGBROKER_CONFIG`; `PORT` overrides
//! the listen port. Without a file every setting takes its default, which
//! is enough for a single-node development broker.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use sigbroker::BrokerConfig;

use crate::error::ServiceError;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "SIGBROKER_CONFIG";

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "PORT";

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default timeout of one call to the signing gateway.
pub const DEFAULT_SIGNER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time granted to background work at shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Location and timeout of the signing gateway.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignerConfig {
    /// Base URL of the gateway; requests go to `{url}/sign`.
    #[builder(into)]
    pub url: String,

    #[serde(with = "humantime_serde", default = "default_signer_timeout")]
    #[builder(default = DEFAULT_SIGNER_TIMEOUT)]
    pub timeout: Duration,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self { url: "http://localhost:9090".to_owned(), timeout: DEFAULT_SIGNER_TIMEOUT }
    }
}

fn default_signer_timeout() -> Duration {
    DEFAULT_SIGNER_TIMEOUT
}

/// Complete configuration of the service binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    #[serde(default)]
    pub signer: SignerConfig,

    /// Broker core settings.
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
}

fn default_shutdown_grace() -> Duration {
    DEFAULT_SHUTDOWN_GRACE
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            signer: SignerConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if the document does not parse or the
    /// broker settings are invalid.
    pub fn from_json(json: &[u8]) -> Result<Self, ServiceError> {
        let config: Self = serde_json::from_slice(json)
            .map_err(|e| ServiceError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Io`] if the file cannot be read, or any error
    /// [`from_json`](Self::from_json) reports.
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        let raw = std::fs::read(path)?;
        Self::from_json(&raw)
    }

    /// Loads the configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file named by [`CONFIG_ENV`] cannot be loaded
    /// or [`PORT_ENV`] is not a port number.
    pub fn from_env() -> Result<Self, ServiceError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                tracing::warn!("{CONFIG_ENV} not set, using default configuration");
                Self::default()
            },
        };
        if let Ok(port) = std::env::var(PORT_ENV) {
            let port: u16 = port
                .parse()
                .map_err(|_| ServiceError::Config(format!("{PORT_ENV} is not a port: {port}")))?;
            config.listen.set_port(port);
        }
        Ok(config)
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] for an empty gateway URL or a zero
    /// timeout, or the broker's own validation error.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.signer.url.trim().is_empty() {
            return Err(ServiceError::Config("signer.url must not be empty".into()));
        }
        if self.signer.timeout.is_zero() {
            return Err(ServiceError::Config("signer.timeout must be positive".into()));
        }
        self.broker.validate().map_err(|e| ServiceError::Config(e.to_string()))
    }
}
