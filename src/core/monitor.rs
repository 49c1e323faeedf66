//! Reader presence monitor.
//!
//! Turns PC/SC reader state changes into card-inserted / card-removed events
//! and owns the session of the card currently in the field. The session slot
//! is the single source of truth: every operation holds its lock for the
//! whole frame sequence, and each insertion or removal bumps a generation
//! counter so a connect that resolves after the card already left is dropped.

use crate::core::apdu::BlockLayout;
use crate::core::config::ReaderConfig;
use crate::core::error::{NfcError, Result};
use crate::core::history::ApduHistory;
use crate::core::session::{pad_to_blocks, CardInfo, CardSession, Link, Uid};
use crate::core::transport::{StatusChange, StatusEvent, Transport};
use pcsc::{Disposition, State};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};

/// Presence transition derived from two consecutive reader states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CardInserted,
    CardRemoved,
}

/// Only bits that flipped between `previous` and `current` count.
pub fn transition(previous: State, current: State) -> Option<Transition> {
    let changed = previous ^ current;

    if changed.intersects(State::EMPTY) && current.contains(State::EMPTY) {
        Some(Transition::CardRemoved)
    } else if changed.intersects(State::PRESENT) && current.contains(State::PRESENT) {
        Some(Transition::CardInserted)
    } else {
        None
    }
}

/// Events published to listeners of one or more readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ReaderEvent {
    ReaderAttached { reader: String },
    ReaderDetached { reader: String },
    CardInserted { reader: String, card: CardInfo },
    CardRemoved { reader: String },
    ReaderError { reader: String, message: String },
}

impl ReaderEvent {
    pub fn reader(&self) -> &str {
        match self {
            Self::ReaderAttached { reader }
            | Self::ReaderDetached { reader }
            | Self::CardInserted { reader, .. }
            | Self::CardRemoved { reader }
            | Self::ReaderError { reader, .. } => reader,
        }
    }
}

impl fmt::Display for ReaderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReaderAttached { reader } => write!(f, "[{reader}] reader attached"),
            Self::ReaderDetached { reader } => write!(f, "[{reader}] reader detached"),
            Self::CardInserted { reader, card } => {
                write!(f, "[{reader}] card inserted ({})", card.standard)
            }
            Self::CardRemoved { reader } => write!(f, "[{reader}] card removed"),
            Self::ReaderError { reader, message } => write!(f, "[{reader}] error: {message}"),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u64,
    card: Option<CardSession>,
}

/// Presence state machine and card facade for one reader.
pub struct ReaderMonitor<T> {
    name: String,
    transport: T,
    config: ReaderConfig,
    slot: Mutex<Slot>,
    last_state: StdMutex<State>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    history: Option<Arc<StdMutex<ApduHistory>>>,
}

impl<T: Transport> ReaderMonitor<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        config: ReaderConfig,
        events: mpsc::UnboundedSender<ReaderEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            config,
            slot: Mutex::new(Slot::default()),
            last_state: StdMutex::new(State::UNAWARE),
            events,
            history: None,
        }
    }

    /// Record every exchanged frame into `history`.
    pub fn with_history(mut self, history: Arc<StdMutex<ApduHistory>>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Snapshot of the current card, if one is connected.
    pub async fn card(&self) -> Option<CardInfo> {
        let slot = self.slot.lock().await;
        slot.card
            .as_ref()
            .filter(|card| card.is_connected())
            .map(CardSession::info)
    }

    pub async fn is_card_present(&self) -> bool {
        self.card().await.is_some()
    }

    /// Apply a reader state change.
    ///
    /// Returns the transition that was acted on. Connect failures on
    /// insertion are returned; disconnect failures on removal are only
    /// logged.
    pub async fn handle_status(&self, change: &StatusChange) -> Result<Option<Transition>> {
        let previous = {
            let mut last = self
                .last_state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *last, change.state)
        };

        let Some(transition) = transition(previous, change.state) else {
            log::trace!("{}: state {:?} -> {:?}, no action", self.name, previous, change.state);
            return Ok(None);
        };

        match transition {
            Transition::CardRemoved => self.card_removed().await,
            Transition::CardInserted => {
                self.card_inserted(change.atr.as_deref().unwrap_or_default())
                    .await?
            }
        }
        Ok(Some(transition))
    }

    /// Drive the monitor from a status watcher until it stops.
    pub async fn run(&self, mut status: mpsc::Receiver<StatusEvent>) {
        log::info!("{}: monitoring started", self.name);

        while let Some(event) = status.recv().await {
            match event {
                StatusEvent::Changed(change) => {
                    if let Err(e) = self.handle_status(&change).await {
                        log::error!("{}: {e}", self.name);
                        self.emit(ReaderEvent::ReaderError {
                            reader: self.name.clone(),
                            message: e.to_string(),
                        });
                    }
                }
                StatusEvent::Failed(message) => {
                    log::error!("{}: status watch failed: {message}", self.name);
                    self.emit(ReaderEvent::ReaderError {
                        reader: self.name.clone(),
                        message,
                    });
                    break;
                }
            }
        }

        // the reader is gone, and any card with it
        self.card_removed().await;
        log::info!("{}: monitoring stopped", self.name);
    }

    async fn card_inserted(&self, atr: &[u8]) -> Result<()> {
        let session = CardSession::new(atr);
        log::info!("{}: card inserted ({})", self.name, session.standard());

        let generation = {
            let mut slot = self.slot.lock().await;
            slot.generation += 1;
            slot.card = Some(session);
            slot.generation
        };

        let connected = self.transport.connect(self.config.share_mode.into()).await;

        let mut slot = self.slot.lock().await;
        let is_current = slot.generation == generation;
        let protocol = match connected {
            Ok(protocol) => protocol,
            Err(e) => {
                if is_current {
                    slot.card = None;
                }
                return Err(e);
            }
        };

        match slot.card.as_mut().filter(|_| is_current) {
            Some(card) => {
                card.attach(protocol);
                let info = card.info();
                drop(slot);

                log::info!("{}: card connected ({protocol:?})", self.name);
                self.emit(ReaderEvent::CardInserted {
                    reader: self.name.clone(),
                    card: info,
                });
            }
            None => {
                let replaced = slot.card.is_some();
                drop(slot);

                log::warn!("{}: card left before connect completed, discarding", self.name);
                if !replaced {
                    self.release().await;
                }
            }
        }
        Ok(())
    }

    async fn card_removed(&self) {
        let removed = {
            let mut slot = self.slot.lock().await;
            slot.generation += 1;
            slot.card.take()
        };

        if removed.is_none() {
            log::debug!("{}: reader empty", self.name);
            return;
        }

        log::info!("{}: card removed", self.name);
        self.emit(ReaderEvent::CardRemoved {
            reader: self.name.clone(),
        });
        self.release().await;
    }

    async fn release(&self) {
        if let Err(e) = self.transport.disconnect(Disposition::LeaveCard).await {
            log::warn!("{}: failed to disconnect cleanly from card: {e}", self.name);
        }
    }

    fn emit(&self, event: ReaderEvent) {
        // listeners may have gone away
        let _ = self.events.send(event);
    }

    fn link(&self) -> Link<'_, T> {
        Link::new(&self.transport)
            .with_timeout(self.config.transmit_timeout())
            .with_history(self.history.as_deref())
    }

    /// UID of the card in the field (memory tags only).
    pub async fn uid(&self) -> Result<Uid> {
        let mut slot = self.slot.lock().await;
        let card = slot.card.as_mut().ok_or(NfcError::NoCardPresent)?;
        card.read_uid(&self.link()).await
    }

    /// Write whole blocks using the configured block size.
    pub async fn write_bytes(&self, block: usize, data: &[u8]) -> Result<()> {
        self.write_bytes_with(block, data, self.config.block_size)
            .await
    }

    pub async fn write_bytes_with(&self, block: usize, data: &[u8], block_size: usize) -> Result<()> {
        let slot = self.slot.lock().await;
        let card = slot.card.as_ref().ok_or(NfcError::NoCardPresent)?;
        card.write_blocks(&self.link(), block, data, block_size).await
    }

    /// Write `text` as UTF-8, zero-padded to whole blocks.
    ///
    /// Returns the number of bytes written, padding included.
    pub async fn write_text(&self, block: usize, text: &str) -> Result<usize> {
        let data = pad_to_blocks(text, self.config.block_size);
        self.write_bytes(block, &data).await?;
        Ok(data.len())
    }

    /// Read raw bytes using the configured block layout.
    pub async fn read_bytes(&self, block: usize, length: usize) -> Result<Vec<u8>> {
        self.read_bytes_with(block, length, self.config.layout())
            .await
    }

    pub async fn read_bytes_with(
        &self,
        block: usize,
        length: usize,
        layout: BlockLayout,
    ) -> Result<Vec<u8>> {
        let slot = self.slot.lock().await;
        let card = slot.card.as_ref().ok_or(NfcError::NoCardPresent)?;
        card.read_blocks(&self.link(), block, length, layout).await
    }

    /// Read `length` bytes and decode them as UTF-8, replacing invalid
    /// sequences.
    pub async fn read_text(&self, block: usize, length: usize) -> Result<String> {
        let data = self.read_bytes(block, length).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_to_present_is_insertion() {
        assert_eq!(
            transition(State::EMPTY, State::PRESENT),
            Some(Transition::CardInserted)
        );
        assert_eq!(
            transition(State::UNAWARE, State::PRESENT | State::CHANGED),
            Some(Transition::CardInserted)
        );
    }

    #[test]
    fn test_present_to_empty_is_removal() {
        assert_eq!(
            transition(State::PRESENT, State::EMPTY),
            Some(Transition::CardRemoved)
        );
        assert_eq!(
            transition(State::PRESENT | State::INUSE, State::EMPTY | State::CHANGED),
            Some(Transition::CardRemoved)
        );
    }

    #[test]
    fn test_unchanged_mask_is_ignored() {
        assert_eq!(transition(State::PRESENT, State::PRESENT), None);
        assert_eq!(transition(State::EMPTY, State::EMPTY), None);
        // flipped bits unrelated to presence
        assert_eq!(
            transition(State::PRESENT, State::PRESENT | State::INUSE),
            None
        );
        // presence bit cleared without the empty bit being set
        assert_eq!(transition(State::PRESENT, State::UNAVAILABLE), None);
    }

    #[test]
    fn test_event_display_and_reader() {
        let event = ReaderEvent::CardRemoved {
            reader: "ACS ACR122U".to_string(),
        };
        assert_eq!(event.to_string(), "[ACS ACR122U] card removed");
        assert_eq!(event.reader(), "ACS ACR122U");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"card-removed\""));
    }
}
