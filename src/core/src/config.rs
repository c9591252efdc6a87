//! Engine and store configuration.

use std::time::Duration;

use crate::error::{Result, SquashError};

/// Default timeout for image store operations, in seconds.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 600;

/// Environment variable overriding the store timeout (integer seconds).
pub const STORE_TIMEOUT_ENV: &str = "SQUASH_STORE_TIMEOUT";

/// Image store connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Timeout applied to store operations
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
        }
    }
}

impl StoreConfig {
    /// Build a store configuration from the environment.
    ///
    /// Reads `SQUASH_STORE_TIMEOUT` when set; the value must parse as a
    /// positive integer number of seconds.
    pub fn from_env() -> Result<Self> {
        match std::env::var(STORE_TIMEOUT_ENV) {
            Err(_) => Ok(Self::default()),
            Ok(value) => {
                let secs: i64 = value.parse().map_err(|_| {
                    SquashError::Config(format!(
                        "provided timeout value '{value}' cannot be parsed as an integer"
                    ))
                })?;
                if secs <= 0 {
                    return Err(SquashError::Config(
                        "provided timeout value needs to be greater than zero".to_string(),
                    ));
                }
                Ok(Self {
                    timeout: Duration::from_secs(secs as u64),
                })
            }
        }
    }
}
