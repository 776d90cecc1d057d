use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MAX_COMPLETED_TX_COUNT: usize = 1 << 18;
pub const DEFAULT_TX_SALVAGE_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_RECOVERY_BUFFER_SIZE: usize = 4096;

pub const MAX_COMPLETED_TX_COUNT_ENV: &str = "GRIDCACHE_MAX_COMPLETED_TX_COUNT";
pub const SLOW_TX_WARN_TIMEOUT_ENV: &str = "GRIDCACHE_SLOW_TX_WARN_TIMEOUT";
pub const TX_SALVAGE_TIMEOUT_ENV: &str = "GRIDCACHE_TX_SALVAGE_TIMEOUT";
pub const TX_SERIALIZABLE_ENABLED_ENV: &str = "GRIDCACHE_TX_SERIALIZABLE_ENABLED";

/// Configuration for the transaction manager
#[derive(Debug, Clone)]
pub struct TxManagerConfig {
    /// Capacity of the committed and rolled back version sets
    pub max_completed_tx_count: usize,

    /// Local transactions running longer than this are logged (zero disables the warning)
    pub slow_tx_warn_timeout: Duration,

    /// Delay between a node leaving and the salvage of its transactions
    pub tx_salvage_timeout: Duration,

    /// Whether optimistic serializable validation and start version tracking are enabled
    pub serializable_enabled: bool,

    /// Capacity of the pessimistic recovery buffer
    pub recovery_buffer_size: usize,
}

impl Default for TxManagerConfig {
    fn default() -> Self {
        Self {
            max_completed_tx_count: DEFAULT_MAX_COMPLETED_TX_COUNT,
            slow_tx_warn_timeout: Duration::ZERO,
            tx_salvage_timeout: Duration::from_millis(DEFAULT_TX_SALVAGE_TIMEOUT_MS),
            serializable_enabled: false,
            recovery_buffer_size: DEFAULT_RECOVERY_BUFFER_SIZE,
        }
    }
}

impl TxManagerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults, unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(count) = parse::<usize>(&lookup, MAX_COMPLETED_TX_COUNT_ENV) {
            config.max_completed_tx_count = count.max(1);
        }
        if let Some(ms) = parse::<u64>(&lookup, SLOW_TX_WARN_TIMEOUT_ENV) {
            config.slow_tx_warn_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, TX_SALVAGE_TIMEOUT_ENV) {
            config.tx_salvage_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse::<bool>(&lookup, TX_SERIALIZABLE_ENABLED_ENV) {
            config.serializable_enabled = enabled;
        }
        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}
