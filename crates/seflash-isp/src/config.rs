//! Protocol constants and timings
//!
//! Everything tunable about the ISP exchange lives in one [`IspConfig`],
//! built once at startup and passed by reference to every layer. The
//! defaults are the values the enclave firmware is known to work with.
//! A TOML file may override individual keys; durations are given in
//! milliseconds:
//!
//! ```toml
//! reboot_wait_ms = 8000
//! reopen_retries = 8
//! ```

use crate::error::{IspError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// The only baud rate the SE-UART ISP protocol runs at
pub const BAUD_RATE: u32 = 57_600;

/// Maximum image bytes per DOWNLOAD_DATA frame
pub const DATA_PER_CHUNK: usize = 240;

/// MRAM writes are padded to this boundary
pub const IMAGE_ALIGNMENT: usize = 16;

/// Complete configuration for an ISP session
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IspConfig {
    /// Serial baud rate, always [`BAUD_RATE`]
    pub baud_rate: u32,
    /// Image bytes per data chunk
    pub chunk_size: usize,
    /// Image padding boundary
    pub alignment: usize,

    /// Attempts to open the port on first connect
    pub open_retries: u32,
    /// Pause between open attempts
    #[serde(rename = "open_backoff_ms", with = "millis")]
    pub open_backoff: Duration,
    /// Attempts to reopen the port after the enclave resets
    pub reopen_retries: u32,
    /// Pause between reopen attempts
    #[serde(rename = "reopen_backoff_ms", with = "millis")]
    pub reopen_backoff: Duration,

    /// Pause before draining stale input
    #[serde(rename = "drain_settle_ms", with = "millis")]
    pub drain_settle: Duration,
    /// Pause between drain reads
    #[serde(rename = "drain_pause_ms", with = "millis")]
    pub drain_pause: Duration,
    /// Give up draining after this long, even if input keeps arriving
    #[serde(rename = "drain_limit_ms", with = "millis")]
    pub drain_limit: Duration,

    /// Delay between sending a command and reading its response
    #[serde(rename = "command_settle_ms", with = "millis")]
    pub command_settle: Duration,
    /// Response timeout for commands
    #[serde(rename = "command_timeout_ms", with = "millis")]
    pub command_timeout: Duration,
    /// Delay between sending a data chunk and reading its response
    #[serde(rename = "chunk_settle_ms", with = "millis")]
    pub chunk_settle: Duration,
    /// Response timeout for data chunks
    #[serde(rename = "chunk_timeout_ms", with = "millis")]
    pub chunk_timeout: Duration,

    /// START_ISP attempts before giving up
    pub start_isp_attempts: u32,
    /// Pause between START_ISP attempts
    #[serde(rename = "start_isp_pause_ms", with = "millis")]
    pub start_isp_pause: Duration,

    /// Time the enclave needs to reboot after RESET_DEVICE
    #[serde(rename = "reboot_wait_ms", with = "millis")]
    pub reboot_wait: Duration,
    /// Pause between entering maintenance mode and flashing
    #[serde(rename = "post_maintenance_delay_ms", with = "millis")]
    pub post_maintenance_delay: Duration,

    /// Log a progress line every this many chunks
    pub progress_interval: usize,
}

impl Default for IspConfig {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            chunk_size: DATA_PER_CHUNK,
            alignment: IMAGE_ALIGNMENT,
            open_retries: 3,
            open_backoff: Duration::from_secs(2),
            reopen_retries: 5,
            reopen_backoff: Duration::from_secs(2),
            drain_settle: Duration::from_millis(100),
            drain_pause: Duration::from_millis(50),
            drain_limit: Duration::from_secs(2),
            command_settle: Duration::from_millis(50),
            command_timeout: Duration::from_secs(2),
            chunk_settle: Duration::from_millis(20),
            chunk_timeout: Duration::from_secs(1),
            start_isp_attempts: 3,
            start_isp_pause: Duration::from_millis(300),
            reboot_wait: Duration::from_secs(5),
            post_maintenance_delay: Duration::from_secs(1),
            progress_interval: 50,
        }
    }
}

impl IspConfig {
    /// Parse a TOML override file; missing keys keep their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: IspConfig = toml::from_str(s).map_err(|e| IspError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML override file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        // Sequence number takes two bytes of the frame payload
        if self.chunk_size == 0 || self.chunk_size + 2 > crate::protocol::MAX_PAYLOAD {
            return Err(IspError::Config(format!(
                "chunk_size must be between 1 and {}",
                crate::protocol::MAX_PAYLOAD - 2
            )));
        }
        if self.alignment == 0 {
            return Err(IspError::Config("alignment must be non-zero".into()));
        }
        if self.open_retries == 0 || self.reopen_retries == 0 || self.start_isp_attempts == 0 {
            return Err(IspError::Config(
                "retry and attempt counts must be at least 1".into(),
            ));
        }
        if self.progress_interval == 0 {
            return Err(IspError::Config("progress_interval must be non-zero".into()));
        }
        if self.baud_rate != BAUD_RATE {
            return Err(IspError::Config(format!(
                "baud_rate must be {} (got {})",
                BAUD_RATE, self.baud_rate
            )));
        }
        if self.drain_limit.is_zero() {
            return Err(IspError::Config("drain_limit_ms must be non-zero".into()));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IspConfig::default();
        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.chunk_size, 240);
        assert_eq!(config.open_retries, 3);
        assert_eq!(config.reopen_retries, 5);
        assert_eq!(config.reboot_wait, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config = IspConfig::from_toml_str(
            r#"
reboot_wait_ms = 8000
reopen_retries = 8
"#,
        )
        .unwrap();
        assert_eq!(config.reboot_wait, Duration::from_secs(8));
        assert_eq!(config.reopen_retries, 8);
        assert_eq!(config.open_retries, 3);
        assert_eq!(config.chunk_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_config() {
        assert!(IspConfig::from_toml_str("chunk_size = 300").is_err());
        assert!(IspConfig::from_toml_str("start_isp_attempts = 0").is_err());
        assert!(IspConfig::from_toml_str("no_such_key = 1").is_err());
        assert!(IspConfig::from_toml_str("drain_limit_ms = 0").is_err());
    }

    #[test]
    fn test_baud_rate_is_fixed() {
        assert!(IspConfig::from_toml_str("baud_rate = 57600").is_ok());
        match IspConfig::from_toml_str("baud_rate = 115200") {
            Err(IspError::Config(msg)) => assert!(msg.contains("57600"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
