//! Card standard classification from the answer-to-reset.
//!
//! Only one byte of the ATR is inspected. PC/SC readers synthesize the ATR of
//! contactless cards (PC/SC part 3); for storage cards byte 5 is the
//! application identifier presence indicator `0x4F`. This is a heuristic and
//! not a full ATR parse.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of the byte that distinguishes memory tags from ISO-DEP cards.
const ATR_STANDARD_INDEX: usize = 5;

/// Byte value marking a storage (memory) tag.
const ATR_STORAGE_CARD: u8 = 0x4F;

/// Communication standard of the card in the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardStandard {
    /// Memory tags (Mifare Ultralight, NTAG and similar).
    Iso14443_3,
    /// Application-layer cards speaking ISO-DEP.
    Iso14443_4,
}

impl CardStandard {
    /// Classify a card from its ATR.
    pub fn from_atr(atr: &[u8]) -> Self {
        match atr.get(ATR_STANDARD_INDEX) {
            Some(&ATR_STORAGE_CARD) => Self::Iso14443_3,
            _ => Self::Iso14443_4,
        }
    }

    /// Memory tags are the only family supporting UID and block I/O here.
    pub fn is_memory_tag(self) -> bool {
        self == Self::Iso14443_3
    }
}

impl fmt::Display for CardStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iso14443_3 => f.write_str("ISO 14443-3"),
            Self::Iso14443_4 => f.write_str("ISO 14443-4"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ACR122U ATR for a Mifare Ultralight
    const ULTRALIGHT_ATR: [u8; 20] = [
        0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x03,
        0x00, 0x00, 0x00, 0x00, 0x68,
    ];

    #[test]
    fn test_storage_card_is_iso14443_3() {
        assert_eq!(CardStandard::from_atr(&ULTRALIGHT_ATR), CardStandard::Iso14443_3);
        assert!(CardStandard::from_atr(&ULTRALIGHT_ATR).is_memory_tag());
    }

    #[test]
    fn test_other_byte_is_iso14443_4() {
        let mut atr = ULTRALIGHT_ATR;
        atr[5] = 0x00;
        assert_eq!(CardStandard::from_atr(&atr), CardStandard::Iso14443_4);

        // DESFire style ATR
        let desfire = [0x3B, 0x81, 0x80, 0x01, 0x80, 0x80];
        assert_eq!(CardStandard::from_atr(&desfire), CardStandard::Iso14443_4);
    }

    #[test]
    fn test_short_atr_is_iso14443_4() {
        assert_eq!(CardStandard::from_atr(&[]), CardStandard::Iso14443_4);
        assert_eq!(
            CardStandard::from_atr(&[0x3B, 0x8F, 0x80, 0x01, 0x80]),
            CardStandard::Iso14443_4
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(CardStandard::Iso14443_3.to_string(), "ISO 14443-3");
        assert_eq!(CardStandard::Iso14443_4.to_string(), "ISO 14443-4");
    }
}
