//! Error types for card sessions and the APDU layer.

use crate::core::apdu::StatusWord;
use crate::core::atr::CardStandard;

/// Result type alias for card operations.
pub type Result<T> = std::result::Result<T, NfcError>;

/// Errors raised while talking to a tag through a reader.
#[derive(Debug, thiserror::Error)]
pub enum NfcError {
    /// No card session, or the session has no protocol handle yet.
    #[error("No card present")]
    NoCardPresent,

    /// The operation is not implemented for this card family.
    #[error("Unsupported card standard: {standard}")]
    UnsupportedStandard { standard: CardStandard },

    /// Update Binary can only write whole blocks.
    #[error("Invalid data length {length}: only whole blocks of {block_size} bytes can be updated")]
    InvalidDataLength { length: usize, block_size: usize },

    /// The reply is too short to carry a status word.
    #[error("Invalid response length {length}, expected at least {expected} bytes")]
    InvalidResponseLength { length: usize, expected: usize },

    /// The card answered with a status word other than 0x9000.
    #[error("{operation} failed: status code {status}")]
    CardOperationFailed {
        operation: &'static str,
        status: StatusWord,
    },

    /// A block number does not fit in a single APDU parameter byte.
    #[error("Block {block} is outside the addressable range")]
    InvalidBlockAddress { block: usize },

    /// Block and packet sizes cannot describe a valid read/write plan.
    #[error("Invalid block layout: block size {block_size}, packet size {packet_size}")]
    InvalidLayout {
        block_size: usize,
        packet_size: usize,
    },

    /// A transmit did not complete within the configured deadline.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Failure reported by the PC/SC service.
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Any other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NfcError {
    pub fn card_failed(operation: &'static str, status: StatusWord) -> Self {
        Self::CardOperationFailed { operation, status }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Status word embedded in a card-level failure, if any.
    pub fn status(&self) -> Option<StatusWord> {
        match self {
            Self::CardOperationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_failed_embeds_status() {
        let error = NfcError::card_failed("Write operation", StatusWord(0x6300));
        assert_eq!(error.status(), Some(StatusWord(0x6300)));
        assert_eq!(
            error.to_string(),
            "Write operation failed: status code 0x6300"
        );
    }

    #[test]
    fn test_error_display() {
        assert_eq!(NfcError::NoCardPresent.to_string(), "No card present");
        assert_eq!(
            NfcError::UnsupportedStandard {
                standard: CardStandard::Iso14443_4
            }
            .to_string(),
            "Unsupported card standard: ISO 14443-4"
        );
        assert_eq!(
            NfcError::InvalidResponseLength {
                length: 1,
                expected: 2
            }
            .to_string(),
            "Invalid response length 1, expected at least 2 bytes"
        );
        assert_eq!(
            NfcError::Timeout { duration_ms: 250 }.to_string(),
            "Operation timeout after 250ms"
        );
        assert!(NfcError::NoCardPresent.status().is_none());
    }
}
