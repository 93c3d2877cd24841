//! Configuration Module - Handshake and Scanning Parameters
//!
//! Tunables for the stop-the-world handshake and the scanning helpers.
//! The granule sizes of the card and side tables are fixed (512 bytes) and are
//! not configurable.

use serde::{Deserialize, Serialize};

/// Configuration for the collector substrate
///
/// # Examples
///
/// ```rust
/// use fgc_stw::StwConfig;
///
/// let config = StwConfig {
///     scanner_workers: 2,
///     verbose: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StwConfig {
    /// Backoff spins per mutator before the collector starts sleeping
    ///
    /// Default: 64
    pub quiescence_spin_limit: u32,

    /// Sleep between quiescence polls once spinning is exhausted (microseconds)
    ///
    /// Default: 50us
    pub quiescence_sleep_us: u64,

    /// Waiting longer than this on a single mutator logs a warning
    ///
    /// The wait itself never times out.
    /// Default: 100ms
    pub slow_quiescence_warn_ms: u64,

    /// Number of workers used by the parallel chunk scanner
    ///
    /// Default: number of CPUs, clamped to 1..=8
    pub scanner_workers: usize,

    /// Heap cells carry a debug canary word in front of each object
    ///
    /// Default: enabled in debug builds
    pub debug_cell_tags: bool,

    /// Emit structured cycle events to the global logger
    ///
    /// Default: false
    pub verbose: bool,
}

impl Default for StwConfig {
    fn default() -> Self {
        StwConfig {
            quiescence_spin_limit: 64,
            quiescence_sleep_us: 50,
            slow_quiescence_warn_ms: 100,
            scanner_workers: num_cpus::get().clamp(1, 8),
            debug_cell_tags: cfg!(debug_assertions),
            verbose: false,
        }
    }
}

impl StwConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner_workers == 0 {
            return Err(ConfigError::InvalidWorkers(
                "scanner_workers must be > 0".to_string(),
            ));
        }

        if self.scanner_workers > MAX_SCANNER_WORKERS {
            return Err(ConfigError::InvalidWorkers(format!(
                "scanner_workers must be <= {}",
                MAX_SCANNER_WORKERS
            )));
        }

        if self.quiescence_sleep_us == 0 {
            return Err(ConfigError::InvalidPolling(
                "quiescence_sleep_us must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Build configuration from environment variables
    ///
    /// Overrides defaults with:
    /// - STW_QUIESCENCE_SLEEP_US
    /// - STW_SPIN_LIMIT
    /// - STW_SCANNER_WORKERS
    /// - STW_DEBUG_CELL_TAGS
    /// - STW_VERBOSE
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("STW_QUIESCENCE_SLEEP_US") {
            if let Ok(us) = val.parse::<u64>() {
                config.quiescence_sleep_us = us;
            }
        }

        if let Ok(val) = std::env::var("STW_SPIN_LIMIT") {
            if let Ok(spins) = val.parse::<u32>() {
                config.quiescence_spin_limit = spins;
            }
        }

        if let Ok(val) = std::env::var("STW_SCANNER_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                config.scanner_workers = workers;
            }
        }

        if let Ok(val) = std::env::var("STW_DEBUG_CELL_TAGS") {
            config.debug_cell_tags = parse_flag(&val);
        }

        if let Ok(val) = std::env::var("STW_VERBOSE") {
            config.verbose = parse_flag(&val);
        }

        config
    }
}

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid scanner workers: {0}")]
    InvalidWorkers(String),

    #[error("Invalid quiescence polling: {0}")]
    InvalidPolling(String),
}

const MAX_SCANNER_WORKERS: usize = 64;

fn parse_flag(val: &str) -> bool {
    val == "1" || val.eq_ignore_ascii_case("true")
}
