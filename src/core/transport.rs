//! Transport abstraction between card sessions and the PC/SC driver.
//!
//! One transport instance serves one physical reader. It holds at most one
//! card connection at a time: `connect` replaces it, `disconnect` releases it
//! and `transmit` exchanges a frame over it.
//!
//! Methods return `impl Future + Send` so monitors built on any transport can
//! be spawned onto a multi-threaded runtime. Implementations may simply write
//! `async fn`.
//!
//! ```no_run
//! use pcsc::{Disposition, Protocol, ShareMode};
//! use pcsc_nfc::core::{error::Result, transport::Transport};
//!
//! struct Loopback;
//!
//! impl Transport for Loopback {
//!     async fn connect(&self, _share_mode: ShareMode) -> Result<Protocol> {
//!         Ok(Protocol::T1)
//!     }
//!
//!     async fn disconnect(&self, _disposition: Disposition) -> Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn transmit(&self, _command: &[u8], _max_len: usize, _protocol: Protocol) -> Result<Vec<u8>> {
//!         Ok(vec![0x90, 0x00])
//!     }
//! }
//! ```

use crate::core::error::Result;
use pcsc::{Disposition, Protocol, ShareMode, State};
use std::future::Future;
use std::sync::Arc;

/// Reader-level primitives consumed by sessions and monitors.
pub trait Transport: Send + Sync {
    /// Connect to the card in the field, returning the active protocol.
    fn connect(&self, share_mode: ShareMode) -> impl Future<Output = Result<Protocol>> + Send;

    /// Release the current card connection.
    fn disconnect(&self, disposition: Disposition) -> impl Future<Output = Result<()>> + Send;

    /// Send `command` and return the reply (data followed by the status word).
    ///
    /// `max_response_len` is the largest reply the caller expects.
    fn transmit(
        &self,
        command: &[u8],
        max_response_len: usize,
        protocol: Protocol,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn connect(&self, share_mode: ShareMode) -> impl Future<Output = Result<Protocol>> + Send {
        (**self).connect(share_mode)
    }

    fn disconnect(&self, disposition: Disposition) -> impl Future<Output = Result<()>> + Send {
        (**self).disconnect(disposition)
    }

    fn transmit(
        &self,
        command: &[u8],
        max_response_len: usize,
        protocol: Protocol,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send {
        (**self).transmit(command, max_response_len, protocol)
    }
}

/// Notification produced by a reader's status watcher.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// The reader state bits changed.
    Changed(StatusChange),
    /// The watcher stopped; the reader is gone or the service failed.
    Failed(String),
}

/// New reader state, with the ATR of the card when one is present.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub state: State,
    pub atr: Option<Vec<u8>>,
}

impl StatusChange {
    pub fn new(state: State, atr: Option<Vec<u8>>) -> Self {
        Self { state, atr }
    }

    pub fn present(atr: &[u8]) -> Self {
        Self::new(State::PRESENT, Some(atr.to_vec()))
    }

    pub fn empty() -> Self {
        Self::new(State::EMPTY, None)
    }
}
