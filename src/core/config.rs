//! Reader configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to the
//! defaults below.
//!
//! ```json
//! { "block_size": 4, "packet_size": 16, "share_mode": "shared",
//!   "poll_timeout_ms": 1000, "transmit_timeout_ms": 2000 }
//! ```

use crate::core::apdu::{BlockLayout, DEFAULT_BLOCK_SIZE, DEFAULT_PACKET_SIZE};
use crate::core::error::{NfcError, Result};
use pcsc::ShareMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection share mode for card sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareModeSetting {
    #[default]
    Shared,
    Exclusive,
}

impl std::str::FromStr for ShareModeSetting {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            _ => Err(format!("Invalid share mode: {s}")),
        }
    }
}

impl From<ShareModeSetting> for ShareMode {
    fn from(mode: ShareModeSetting) -> Self {
        match mode {
            ShareModeSetting::Shared => ShareMode::Shared,
            ShareModeSetting::Exclusive => ShareMode::Exclusive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub block_size: usize,
    pub packet_size: usize,
    pub share_mode: ShareModeSetting,
    /// Wait slice for PC/SC status-change polling.
    pub poll_timeout_ms: u64,
    /// Deadline for a single transmit; none waits forever.
    pub transmit_timeout_ms: Option<u64>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
            share_mode: ShareModeSetting::Shared,
            poll_timeout_ms: 1000,
            transmit_timeout_ms: None,
        }
    }
}

impl ReaderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| NfcError::config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            NfcError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.layout().validate()?;
        if self.poll_timeout_ms == 0 {
            return Err(NfcError::config("poll_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.block_size, self.packet_size)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn transmit_timeout(&self) -> Option<Duration> {
        self.transmit_timeout_ms.map(Duration::from_millis)
    }
}
