//! # Configuration Management Module
//!
//! Loads, validates and writes the relay configuration.
//!
//! ## Configuration Structure
//!
//! - [`RelayConfig`] - Target caps and remote call deadlines
//! - [`RateLimitConfig`] - Per-connection token bucket sizes and refill intervals
//! - [`LoggingConfig`] - Log level and log file locations
//!
//! ## Usage
//!
//! ```rust,no_run
//! use friendrelay::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("relay.toml").await?;
//!     config.validate()?;
//!     println!("max targets: {}", config.relay.max_targets);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [relay]
//! max_targets = 20
//! forward_timeout_ms = 8000
//! body_swap_query_timeout_ms = 8000
//! possession_timeout_ms = 3000
//!
//! [rate_limit]
//! general_capacity = 10
//! general_refill_interval_ms = 1000
//! possession_capacity = 60
//! possession_refill_interval_ms = 1000
//!
//! [logging]
//! level = "info"
//! file = "friendrelay.log"
//! security_file = "friendrelay-security.log"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum number of targets a single request may name.
    pub max_targets: usize,
    /// Deadline for one forwarded command to one target (ms).
    pub forward_timeout_ms: u64,
    /// Overall deadline for the body swap query phase (ms).
    pub body_swap_query_timeout_ms: u64,
    /// Deadline for possession begin, end and stream packets (ms).
    #[serde(default = "default_possession_timeout_ms")]
    pub possession_timeout_ms: u64,
}

fn default_possession_timeout_ms() -> u64 {
    3000
}

impl RelayConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
    pub fn body_swap_query_timeout(&self) -> Duration {
        Duration::from_millis(self.body_swap_query_timeout_ms)
    }
    pub fn possession_timeout(&self) -> Duration {
        Duration::from_millis(self.possession_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub general_capacity: u32,
    pub general_refill_interval_ms: u64,
    /// The possession stream bucket is sized for camera/movement packet rates.
    pub possession_capacity: u32,
    pub possession_refill_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    #[serde(default)]
    pub security_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would disable a limit or a deadline.
    pub fn validate(&self) -> Result<()> {
        if self.relay.max_targets == 0 {
            return Err(anyhow!("relay.max_targets must be at least 1"));
        }
        for (name, value) in [
            ("relay.forward_timeout_ms", self.relay.forward_timeout_ms),
            ("relay.body_swap_query_timeout_ms", self.relay.body_swap_query_timeout_ms),
            ("relay.possession_timeout_ms", self.relay.possession_timeout_ms),
            ("rate_limit.general_refill_interval_ms", self.rate_limit.general_refill_interval_ms),
            (
                "rate_limit.possession_refill_interval_ms",
                self.rate_limit.possession_refill_interval_ms,
            ),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }
        if self.rate_limit.general_capacity == 0 {
            return Err(anyhow!("rate_limit.general_capacity must be greater than 0"));
        }
        if self.rate_limit.possession_capacity == 0 {
            return Err(anyhow!("rate_limit.possession_capacity must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            relay: RelayConfig {
                max_targets: 20,
                forward_timeout_ms: 8000,
                body_swap_query_timeout_ms: 8000,
                possession_timeout_ms: default_possession_timeout_ms(),
            },
            rate_limit: RateLimitConfig {
                general_capacity: 10,
                general_refill_interval_ms: 1000,
                possession_capacity: 60,
                possession_refill_interval_ms: 1000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("friendrelay.log".to_string()),
                security_file: Some("friendrelay-security.log".to_string()),
            },
        }
    }
}
