use crate::core::atr::CardStandard;
use crate::core::error::{NfcError, Result};
use crate::core::transport::{StatusChange, StatusEvent, Transport};
use crate::core::utils::format_hex_spaced;
use pcsc::{Card, Context, Disposition, Protocol, Protocols, ReaderState, Scope, ShareMode, State};
use serde::Serialize;
use std::ffi::CString;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

/// Information about a PCSC reader
#[derive(Debug, Clone, Serialize)]
pub struct ReaderInfo {
    pub name: String,
    pub card_present: bool,
    pub atr: Option<Vec<u8>>,
    pub standard: Option<CardStandard>,
    #[serde(skip)]
    pub state: State,
}

impl ReaderInfo {
    /// Status change that brings a fresh monitor in sync with this reader.
    pub fn status_change(&self) -> StatusChange {
        StatusChange::new(self.state, self.atr.clone())
    }
}

/// Shared PC/SC service context
#[derive(Clone)]
pub struct PcscContext {
    context: Context,
}

impl PcscContext {
    /// Establish a user-scope PC/SC context
    pub fn establish() -> Result<Self> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context })
    }

    /// Names of all connected readers
    pub fn reader_names(&self) -> Result<Vec<String>> {
        let mut readers_buf = vec![0; 2048];
        let names = match self.context.list_readers(&mut readers_buf) {
            Ok(readers) => readers
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(names)
    }

    /// List all readers with their current card status
    pub fn list_readers(&self) -> Result<Vec<ReaderInfo>> {
        self.reader_names()?
            .iter()
            .map(|name| self.reader_status(name))
            .collect()
    }

    /// Query the current state of a reader without connecting to the card
    pub fn reader_status(&self, reader_name: &str) -> Result<ReaderInfo> {
        let mut states = [ReaderState::new(reader_cstring(reader_name)?, State::UNAWARE)];
        self.context
            .get_status_change(Duration::ZERO, &mut states)?;

        let state = states[0].event_state();
        let card_present = state.contains(State::PRESENT);
        let atr = card_present.then(|| states[0].atr().to_vec());

        Ok(ReaderInfo {
            name: reader_name.to_string(),
            card_present,
            standard: atr.as_deref().map(CardStandard::from_atr),
            atr,
            state,
        })
    }

    /// Transport bound to one reader
    pub fn transport(&self, reader_name: &str) -> Result<PcscTransport> {
        Ok(PcscTransport {
            context: self.context.clone(),
            reader: reader_cstring(reader_name)?,
            card: Arc::new(Mutex::new(None)),
        })
    }

    /// Spawn a thread that reports state changes of `reader_name`.
    ///
    /// The thread blocks on its own PC/SC context in `poll_timeout` slices
    /// and stops once the receiver is dropped or the reader disappears.
    pub fn watch_status(
        &self,
        reader_name: &str,
        poll_timeout: Duration,
    ) -> Result<mpsc::Receiver<StatusEvent>> {
        let reader = reader_cstring(reader_name)?;
        let context = Context::establish(Scope::User)?;
        let (tx, rx) = mpsc::channel(16);

        thread::Builder::new()
            .name(format!("pcsc-status-{reader_name}"))
            .spawn(move || watch_loop(context, reader, poll_timeout, tx))
            .map_err(|e| NfcError::transport(format!("Failed to spawn status watcher: {e}")))?;

        Ok(rx)
    }
}

fn watch_loop(
    context: Context,
    reader: CString,
    poll_timeout: Duration,
    tx: mpsc::Sender<StatusEvent>,
) {
    let name = reader.to_string_lossy().into_owned();
    let mut states = [ReaderState::new(reader, State::UNAWARE)];
    log::debug!("{name}: status watcher started");

    loop {
        match context.get_status_change(poll_timeout, &mut states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => {
                if tx.is_closed() {
                    break;
                }
                continue;
            }
            Err(e) => {
                let _ = tx.blocking_send(StatusEvent::Failed(e.to_string()));
                break;
            }
        }

        let state = states[0].event_state();
        let atr = state
            .contains(State::PRESENT)
            .then(|| states[0].atr().to_vec());
        states[0].sync_current_state();

        if state.intersects(State::UNKNOWN | State::UNAVAILABLE) {
            let _ = tx.blocking_send(StatusEvent::Failed(format!("Reader {name} removed")));
            break;
        }

        log::debug!("{name}: state changed to {state:?}");
        if tx
            .blocking_send(StatusEvent::Changed(StatusChange::new(state, atr)))
            .is_err()
        {
            break;
        }
    }

    log::debug!("{name}: status watcher stopped");
}

fn reader_cstring(reader_name: &str) -> Result<CString> {
    CString::new(reader_name)
        .map_err(|_| NfcError::transport(format!("Invalid reader name: {reader_name}")))
}

/// PC/SC transport for a single reader
///
/// Holds the card connection between `connect` and `disconnect`; blocking
/// driver calls run on tokio's blocking pool.
pub struct PcscTransport {
    context: Context,
    reader: CString,
    card: Arc<Mutex<Option<Card>>>,
}

impl PcscTransport {
    pub fn reader_name(&self) -> String {
        self.reader.to_string_lossy().into_owned()
    }
}

fn lock_card(card: &Mutex<Option<Card>>) -> Result<MutexGuard<'_, Option<Card>>> {
    card.lock()
        .map_err(|_| NfcError::transport("Card handle lock poisoned"))
}

async fn blocking<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| NfcError::transport(format!("PC/SC worker failed: {e}")))?
}

impl Transport for PcscTransport {
    async fn connect(&self, share_mode: ShareMode) -> Result<Protocol> {
        let context = self.context.clone();
        let reader = self.reader.clone();
        let slot = Arc::clone(&self.card);

        blocking(move || {
            log::info!("Connecting to reader: {}", reader.to_string_lossy());
            let card = context.connect(&reader, share_mode, Protocols::ANY)?;
            let protocol = card.status2_owned()?.protocol2().ok_or_else(|| {
                NfcError::transport("Card connected without an active protocol")
            })?;

            if let Some(previous) = lock_card(&slot)?.replace(card) {
                let _ = previous
                    .disconnect(Disposition::LeaveCard)
                    .map_err(|(_, e)| log::warn!("Failed to release previous card handle: {e}"));
            }
            Ok(protocol)
        })
        .await
    }

    async fn disconnect(&self, disposition: Disposition) -> Result<()> {
        let slot = Arc::clone(&self.card);

        blocking(move || {
            let card = lock_card(&slot)?.take().ok_or(NfcError::NoCardPresent)?;
            card.disconnect(disposition).map_err(|(_, e)| NfcError::from(e))?;
            log::info!("Disconnected from card");
            Ok(())
        })
        .await
    }

    async fn transmit(
        &self,
        command: &[u8],
        max_response_len: usize,
        protocol: Protocol,
    ) -> Result<Vec<u8>> {
        let slot = Arc::clone(&self.card);
        let command = command.to_vec();

        blocking(move || {
            let guard = lock_card(&slot)?;
            let card = guard.as_ref().ok_or(NfcError::NoCardPresent)?;

            log::trace!("Transmitting over {protocol:?}: {}", format_hex_spaced(&command));
            let mut response_buf = vec![0; max_response_len.max(2)];
            let response = card.transmit(&command, &mut response_buf)?;
            Ok(response.to_vec())
        })
        .await
    }
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.card.lock() {
            if let Some(card) = slot.take() {
                let _ = card
                    .disconnect(Disposition::LeaveCard)
                    .map_err(|_e| log::warn!("Failed to disconnect cleanly from card"));
            }
        }
    }
}
