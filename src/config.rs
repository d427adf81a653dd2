//! Harness configuration and flag validation.

use crate::identity;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

/// Largest accepted prefix length: the record key is a 256-bit double hash.
pub const MAX_PREFIX_LENGTH: u16 = 256;

pub const DEFAULT_COUNT: usize = 10;
pub const DEFAULT_DURATION_SECS: u64 = 600;
pub const DEFAULT_NUM_TEST_CIDS: usize = 20;
pub const DEFAULT_BASE_PORT: u16 = 6000;
pub const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:9000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    #[error("prefix-length must be at most {MAX_PREFIX_LENGTH}")]
    PrefixLengthOutOfRange(u64),
    #[error("fleet must contain at least one node")]
    EmptyFleet,
}

#[derive(Clone, Debug)]
pub struct HarnessConfig {
    pub count: usize,
    pub duration: Duration,
    pub auto_test: bool,
    pub prefix_length: u16,
    pub num_test_cids: usize,
    pub base_port: u16,
    pub rpc_addr: SocketAddr,
    pub key_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            duration: Duration::from_secs(DEFAULT_DURATION_SECS),
            auto_test: false,
            prefix_length: 0,
            num_test_cids: DEFAULT_NUM_TEST_CIDS,
            base_port: DEFAULT_BASE_PORT,
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            key_dir: identity::default_key_dir(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::EmptyFleet);
        }
        validate_prefix_length(u64::from(self.prefix_length))?;
        Ok(())
    }

    /// Listen port for the node at `index`. A base port of zero assigns an
    /// ephemeral port to every node, which tests rely on.
    pub fn node_port(&self, index: usize) -> u16 {
        if self.base_port == 0 {
            0
        } else {
            self.base_port + index as u16
        }
    }
}

/// Bounds-check a prefix length coming from a flag or an RPC request.
pub fn validate_prefix_length(value: u64) -> Result<u16, ConfigError> {
    if value > u64::from(MAX_PREFIX_LENGTH) {
        return Err(ConfigError::PrefixLengthOutOfRange(value));
    }
    Ok(value as u16)
}

/// Parse a `--log` flag value. Accepts the levels the harness documents;
/// anything else is a configuration error.
pub fn parse_log_level(level: &str) -> Result<log::LevelFilter, ConfigError> {
    match level {
        "error" => Ok(log::LevelFilter::Error),
        "warn" => Ok(log::LevelFilter::Warn),
        "info" => Ok(log::LevelFilter::Info),
        "debug" => Ok(log::LevelFilter::Debug),
        other => Err(ConfigError::InvalidLogLevel(other.to_string())),
    }
}

// ----------------------------------------------------------------------------//
