//! APDU frames for memory tags and the block chunking plan.
//!
//! PC/SC readers expose storage cards through pseudo-APDUs with class byte
//! `FF` (PC/SC part 3): Get Data for the UID, Read Binary and Update Binary
//! for block access. Every reply ends with a big-endian status word.
//!
//! Multi-block transfers are planned up front as an explicit list of frames;
//! the session executes the list in order and stops at the first failure.

use crate::core::error::{NfcError, Result};
use crate::core::utils::describe_status_word;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Class byte of the PC/SC storage card pseudo-APDUs.
pub const CLA_PCSC: u8 = 0xFF;
pub const INS_GET_DATA: u8 = 0xCA;
pub const INS_READ_BINARY: u8 = 0xB0;
pub const INS_UPDATE_BINARY: u8 = 0xD6;

/// Length of the status word trailer.
pub const STATUS_WORD_LEN: usize = 2;

/// Reply buffer size requested for Get UID.
pub const UID_RESPONSE_LEN: usize = 40;

pub const DEFAULT_BLOCK_SIZE: usize = 4;
pub const DEFAULT_PACKET_SIZE: usize = 16;

/// Two byte status word (SW1 SW2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const SUCCESS: StatusWord = StatusWord(0x9000);

    pub fn from_bytes(sw1: u8, sw2: u8) -> Self {
        Self(u16::from_be_bytes([sw1, sw2]))
    }

    pub fn sw1(self) -> u8 {
        self.0.to_be_bytes()[0]
    }

    pub fn sw2(self) -> u8 {
        self.0.to_be_bytes()[1]
    }

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Human-readable meaning of the status word.
    pub fn describe(self) -> String {
        describe_status_word(self.sw1(), self.sw2())
    }

    /// Map a non-success status word to a card-level error.
    pub fn check(self, operation: &'static str) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(NfcError::card_failed(operation, self))
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Split a reply into its payload and trailing status word.
pub fn split_response(reply: &[u8]) -> Result<(&[u8], StatusWord)> {
    if reply.len() < STATUS_WORD_LEN {
        return Err(NfcError::InvalidResponseLength {
            length: reply.len(),
            expected: STATUS_WORD_LEN,
        });
    }
    let (data, sw) = reply.split_at(reply.len() - STATUS_WORD_LEN);
    Ok((data, StatusWord::from_bytes(sw[0], sw[1])))
}

/// Get Data (UID): `FF CA 00 00 00`.
pub fn get_uid_command() -> [u8; 5] {
    [CLA_PCSC, INS_GET_DATA, 0x00, 0x00, 0x00]
}

/// Read Binary: `FF B0 00 <block> <length>`.
pub fn read_binary_command(block: u8, length: u8) -> [u8; 5] {
    [CLA_PCSC, INS_READ_BINARY, 0x00, block, length]
}

/// Update Binary: `FF D6 00 <block> <len> <data...>`.
///
/// `data` is one block, at most 255 bytes.
pub fn update_binary_command(block: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= u8::MAX as usize);

    let mut command = Vec::with_capacity(5 + data.len());
    command.extend_from_slice(&[CLA_PCSC, INS_UPDATE_BINARY, 0x00, block, data.len() as u8]);
    command.extend_from_slice(data);
    command
}

/// Block geometry used to plan reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLayout {
    /// Bytes per addressable block.
    pub block_size: usize,
    /// Largest payload fetched by a single Read Binary.
    pub packet_size: usize,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

impl BlockLayout {
    pub fn new(block_size: usize, packet_size: usize) -> Self {
        Self {
            block_size,
            packet_size,
        }
    }

    /// Packets must cover whole blocks and fit in one length byte.
    pub fn validate(&self) -> Result<()> {
        let valid = self.block_size > 0
            && self.packet_size > 0
            && self.packet_size <= u8::MAX as usize
            && self.packet_size % self.block_size == 0;

        if valid {
            Ok(())
        } else {
            Err(NfcError::InvalidLayout {
                block_size: self.block_size,
                packet_size: self.packet_size,
            })
        }
    }

    /// Blocks spanned by one full packet.
    pub fn blocks_per_packet(&self) -> usize {
        self.packet_size / self.block_size
    }
}

/// One Update Binary frame of a write plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    pub block: u8,
    pub command: Vec<u8>,
}

/// One Read Binary frame of a read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRead {
    pub block: u8,
    pub length: u8,
}

impl BlockRead {
    pub fn command(&self) -> [u8; 5] {
        read_binary_command(self.block, self.length)
    }

    /// Reply size including the status word.
    pub fn expected_len(&self) -> usize {
        self.length as usize + STATUS_WORD_LEN
    }
}

fn block_address(block: usize) -> Result<u8> {
    u8::try_from(block).map_err(|_| NfcError::InvalidBlockAddress { block })
}

/// Plan the Update Binary frames for `data` starting at block `start`.
///
/// `data` must be a positive multiple of `block_size`; slice `i` is written
/// to block `start + i`.
pub fn plan_writes(start: usize, data: &[u8], block_size: usize) -> Result<Vec<BlockWrite>> {
    if block_size == 0 || block_size > u8::MAX as usize {
        return Err(NfcError::InvalidLayout {
            block_size,
            packet_size: block_size,
        });
    }
    if data.is_empty() || data.len() % block_size != 0 {
        return Err(NfcError::InvalidDataLength {
            length: data.len(),
            block_size,
        });
    }

    data.chunks(block_size)
        .enumerate()
        .map(|(i, slice)| {
            let block = block_address(start + i)?;
            Ok(BlockWrite {
                block,
                // slice length is block_size, bounded above
                command: update_binary_command(block, slice),
            })
        })
        .collect()
}

/// Plan the Read Binary frames covering `length` bytes from block `start`.
///
/// Sub-read `i` starts at block `start + i * packet_size / block_size` and
/// reads `min(packet_size, length - i * packet_size)` bytes.
pub fn plan_reads(start: usize, length: usize, layout: BlockLayout) -> Result<Vec<BlockRead>> {
    layout.validate()?;

    let count = length.div_ceil(layout.packet_size);
    (0..count)
        .map(|i| {
            let offset = i * layout.packet_size;
            let size = layout.packet_size.min(length - offset);
            Ok(BlockRead {
                block: block_address(start + offset / layout.block_size)?,
                // bounded by packet_size, validated above
                length: size as u8,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_frames() {
        assert_eq!(get_uid_command(), [0xFF, 0xCA, 0x00, 0x00, 0x00]);
        assert_eq!(read_binary_command(4, 16), [0xFF, 0xB0, 0x00, 0x04, 0x10]);
        assert_eq!(
            update_binary_command(7, &[0xDE, 0xAD, 0xBE, 0xEF]),
            vec![0xFF, 0xD6, 0x00, 0x07, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn test_status_word() {
        let sw = StatusWord::from_bytes(0x90, 0x00);
        assert!(sw.is_success());
        assert!(sw.check("Read operation").is_ok());
        assert_eq!(sw.describe(), "Success");

        let sw = StatusWord::from_bytes(0x63, 0x00);
        assert_eq!(sw, StatusWord(0x6300));
        assert_eq!(sw.sw1(), 0x63);
        assert_eq!(sw.sw2(), 0x00);
        assert_eq!(sw.to_string(), "0x6300");
        let err = sw.check("Read operation").unwrap_err();
        assert_eq!(err.status(), Some(StatusWord(0x6300)));
    }

    #[test]
    fn test_split_response() {
        let (data, sw) = split_response(&[0x04, 0xA2, 0x90, 0x00]).unwrap();
        assert_eq!(data, &[0x04, 0xA2]);
        assert_eq!(sw, StatusWord::SUCCESS);

        let (data, sw) = split_response(&[0x6A, 0x82]).unwrap();
        assert!(data.is_empty());
        assert_eq!(sw, StatusWord(0x6A82));

        assert!(matches!(
            split_response(&[0x90]),
            Err(NfcError::InvalidResponseLength {
                length: 1,
                expected: 2
            })
        ));
        assert!(split_response(&[]).is_err());
    }

    #[test]
    fn test_plan_writes_single_block() {
        let plan = plan_writes(4, &[1, 2, 3, 4], 4).unwrap();
        assert_eq!(
            plan,
            vec![BlockWrite {
                block: 4,
                command: vec![0xFF, 0xD6, 0x00, 0x04, 0x04, 1, 2, 3, 4],
            }]
        );
    }

    #[test]
    fn test_plan_writes_splits_into_ascending_blocks() {
        for block_size in [1usize, 2, 4, 16] {
            for blocks in 1..6usize {
                let data: Vec<u8> = (0..(block_size * blocks) as u8).collect();
                let plan = plan_writes(10, &data, block_size).unwrap();

                assert_eq!(plan.len(), blocks);
                for (i, frame) in plan.iter().enumerate() {
                    assert_eq!(frame.block as usize, 10 + i);
                    assert_eq!(frame.command[4] as usize, block_size);
                    assert_eq!(
                        &frame.command[5..],
                        &data[i * block_size..(i + 1) * block_size]
                    );
                }
            }
        }
    }

    #[test]
    fn test_plan_writes_rejects_partial_blocks() {
        for data in [vec![], vec![1, 2, 3], vec![1, 2, 3, 4, 5]] {
            assert!(matches!(
                plan_writes(0, &data, 4),
                Err(NfcError::InvalidDataLength { block_size: 4, .. })
            ));
        }
        assert!(matches!(
            plan_writes(0, &[1, 2, 3, 4], 0),
            Err(NfcError::InvalidLayout { .. })
        ));
        // a block must fit the one-byte length field
        assert!(matches!(
            plan_writes(0, &[0u8; 256], 256),
            Err(NfcError::InvalidLayout {
                block_size: 256,
                ..
            })
        ));
    }

    #[test]
    fn test_plan_writes_rejects_block_overflow() {
        assert!(plan_writes(255, &[0; 4], 4).is_ok());
        assert!(matches!(
            plan_writes(255, &[0; 8], 4),
            Err(NfcError::InvalidBlockAddress { block: 256 })
        ));
    }

    #[test]
    fn test_plan_reads_splits_by_packet() {
        let plan = plan_reads(0, 40, BlockLayout::default()).unwrap();
        assert_eq!(
            plan,
            vec![
                BlockRead { block: 0, length: 16 },
                BlockRead { block: 4, length: 16 },
                BlockRead { block: 8, length: 8 },
            ]
        );

        let plan = plan_reads(4, 36, BlockLayout::default()).unwrap();
        let blocks: Vec<u8> = plan.iter().map(|r| r.block).collect();
        let sizes: Vec<u8> = plan.iter().map(|r| r.length).collect();
        assert_eq!(blocks, vec![4, 8, 12]);
        assert_eq!(sizes, vec![16, 16, 4]);
    }

    #[test]
    fn test_plan_reads_covers_length() {
        let layout = BlockLayout::new(4, 16);
        for length in 1..100usize {
            let plan = plan_reads(0, length, layout).unwrap();
            assert_eq!(plan.len(), length.div_ceil(16));
            let total: usize = plan.iter().map(|r| r.length as usize).sum();
            assert_eq!(total, length);
        }
    }

    #[test]
    fn test_plan_reads_small_and_empty() {
        let plan = plan_reads(2, 5, BlockLayout::default()).unwrap();
        assert_eq!(plan, vec![BlockRead { block: 2, length: 5 }]);
        assert_eq!(plan[0].command(), [0xFF, 0xB0, 0x00, 0x02, 0x05]);
        assert_eq!(plan[0].expected_len(), 7);

        assert!(plan_reads(0, 0, BlockLayout::default()).unwrap().is_empty());
    }

    #[test]
    fn test_layout_validation() {
        assert!(BlockLayout::default().validate().is_ok());
        assert_eq!(BlockLayout::default().blocks_per_packet(), 4);
        assert!(BlockLayout::new(16, 240).validate().is_ok());
        assert!(BlockLayout::new(0, 16).validate().is_err());
        assert!(BlockLayout::new(4, 0).validate().is_err());
        assert!(BlockLayout::new(4, 18).validate().is_err());
        assert!(BlockLayout::new(4, 256).validate().is_err());
        assert!(matches!(
            plan_reads(0, 8, BlockLayout::new(3, 16)),
            Err(NfcError::InvalidLayout { .. })
        ));
    }
}
