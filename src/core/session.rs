//! A single card connection and the storage commands run over it.

use crate::core::apdu::{
    self, BlockLayout, BlockRead, BlockWrite, STATUS_WORD_LEN, UID_RESPONSE_LEN,
};
use crate::core::atr::CardStandard;
use crate::core::error::{NfcError, Result};
use crate::core::history::{ApduHistory, ApduRecord, CommandKind};
use crate::core::transport::Transport;
use crate::core::utils::{format_hex_spaced, reverse_bytes};
use chrono::Utc;
use pcsc::Protocol;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Card UID in both byte orders, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Uid {
    pub hex: String,
    pub reverse_hex: String,
}

/// Snapshot of a session handed to event listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardInfo {
    pub standard: CardStandard,
    pub atr: Vec<u8>,
    pub uid: Option<Uid>,
}

/// State of the card currently in the field.
///
/// Created when a card is inserted and dropped when it leaves; the protocol
/// is only set once the connect completed.
#[derive(Debug, Clone)]
pub struct CardSession {
    standard: CardStandard,
    atr: Vec<u8>,
    protocol: Option<Protocol>,
    uid: Option<Uid>,
}

/// Transport plus the per-reader exchange policy (deadline, history).
pub struct Link<'a, T> {
    transport: &'a T,
    timeout: Option<Duration>,
    history: Option<&'a Mutex<ApduHistory>>,
}

impl<'a, T: Transport> Link<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self {
            transport,
            timeout: None,
            history: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_history(mut self, history: Option<&'a Mutex<ApduHistory>>) -> Self {
        self.history = history;
        self
    }

    async fn exchange(
        &self,
        kind: CommandKind,
        command: &[u8],
        max_response_len: usize,
        protocol: Protocol,
    ) -> Result<Vec<u8>> {
        log::debug!("TX {}: {}", kind.label(), format_hex_spaced(command));
        let started = Instant::now();

        let transmit = self.transport.transmit(command, max_response_len, protocol);
        let result = match self.timeout {
            Some(deadline) => tokio::time::timeout(deadline, transmit)
                .await
                .unwrap_or_else(|_| {
                    Err(NfcError::Timeout {
                        duration_ms: deadline.as_millis() as u64,
                    })
                }),
            None => transmit.await,
        };

        match &result {
            Ok(reply) => log::debug!("RX {}: {}", kind.label(), format_hex_spaced(reply)),
            Err(e) => log::error!("{} failed: {e}", kind.label()),
        }

        if let Some(history) = self.history {
            let record = ApduRecord {
                timestamp: Utc::now(),
                kind,
                command: command.to_vec(),
                response: result.as_ref().cloned().unwrap_or_default(),
                success: result.is_ok(),
                error: result.as_ref().err().map(ToString::to_string),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(record);
        }

        result
    }
}

impl CardSession {
    /// New session for a card whose ATR was just reported.
    pub fn new(atr: &[u8]) -> Self {
        Self {
            standard: CardStandard::from_atr(atr),
            atr: atr.to_vec(),
            protocol: None,
            uid: None,
        }
    }

    pub fn standard(&self) -> CardStandard {
        self.standard
    }

    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn uid(&self) -> Option<&Uid> {
        self.uid.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.protocol.is_some()
    }

    pub(crate) fn attach(&mut self, protocol: Protocol) {
        self.protocol = Some(protocol);
    }

    pub fn info(&self) -> CardInfo {
        CardInfo {
            standard: self.standard,
            atr: self.atr.clone(),
            uid: self.uid.clone(),
        }
    }

    fn connected_protocol(&self) -> Result<Protocol> {
        self.protocol.ok_or(NfcError::NoCardPresent)
    }

    /// Read the card UID with Get Data, caching it for the session lifetime.
    pub async fn read_uid<T: Transport>(&mut self, link: &Link<'_, T>) -> Result<Uid> {
        let protocol = self.connected_protocol()?;
        if !self.standard.is_memory_tag() {
            return Err(NfcError::UnsupportedStandard {
                standard: self.standard,
            });
        }
        if let Some(uid) = &self.uid {
            return Ok(uid.clone());
        }

        let reply = link
            .exchange(
                CommandKind::GetUid,
                &apdu::get_uid_command(),
                UID_RESPONSE_LEN,
                protocol,
            )
            .await?;
        let (uid, status) = apdu::split_response(&reply)?;
        status.check("UID read")?;

        let uid = Uid {
            hex: hex::encode(uid),
            reverse_hex: hex::encode(reverse_bytes(uid)),
        };
        log::info!("Card UID: {} (reversed {})", uid.hex, uid.reverse_hex);
        self.uid = Some(uid.clone());
        Ok(uid)
    }

    /// Update `data.len() / block_size` blocks starting at `block`.
    ///
    /// Blocks are written in ascending order. The first failing block aborts
    /// the write; blocks before it keep their new content.
    pub async fn write_blocks<T: Transport>(
        &self,
        link: &Link<'_, T>,
        block: usize,
        data: &[u8],
        block_size: usize,
    ) -> Result<()> {
        let protocol = self.connected_protocol()?;
        let plan = apdu::plan_writes(block, data, block_size)?;

        for BlockWrite { block, command } in &plan {
            let reply = link
                .exchange(
                    CommandKind::UpdateBinary { block: *block },
                    command,
                    STATUS_WORD_LEN,
                    protocol,
                )
                .await?;
            let (_, status) = apdu::split_response(&reply)?;
            status.check("Write operation")?;
        }

        log::info!(
            "Wrote {} bytes ({} blocks) from block {block}",
            data.len(),
            plan.len()
        );
        Ok(())
    }

    /// Read `length` bytes starting at `block`, one packet at a time.
    pub async fn read_blocks<T: Transport>(
        &self,
        link: &Link<'_, T>,
        block: usize,
        length: usize,
        layout: BlockLayout,
    ) -> Result<Vec<u8>> {
        let protocol = self.connected_protocol()?;
        let plan = apdu::plan_reads(block, length, layout)?;

        let mut payload = Vec::with_capacity(length);
        for read in &plan {
            payload.extend_from_slice(&Self::read_packet(link, read, protocol).await?);
        }
        Ok(payload)
    }

    async fn read_packet<T: Transport>(
        link: &Link<'_, T>,
        read: &BlockRead,
        protocol: Protocol,
    ) -> Result<Vec<u8>> {
        let reply = link
            .exchange(
                CommandKind::ReadBinary {
                    block: read.block,
                    length: read.length,
                },
                &read.command(),
                read.expected_len(),
                protocol,
            )
            .await?;
        let (data, status) = apdu::split_response(&reply)?;
        status.check("Read operation")?;
        Ok(data.to_vec())
    }
}

/// Zero-pad `text` up to the next whole block. Empty text stays empty.
pub fn pad_to_blocks(text: &str, block_size: usize) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    if block_size > 0 {
        let remainder = data.len() % block_size;
        if remainder != 0 {
            data.resize(data.len() + block_size - remainder, 0);
        }
    }
    data
}
