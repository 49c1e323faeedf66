/// PCSC NFC - presence monitoring and block read/write for NFC memory tags
///
/// This library watches PC/SC readers for card insertion and removal, keeps a
/// session for the card in the field, and reads or writes tag memory with
/// Read Binary / Update Binary pseudo-APDUs.
pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    apdu::{BlockLayout, StatusWord},
    atr::CardStandard,
    config::ReaderConfig,
    error::{NfcError, Result},
    monitor::{ReaderEvent, ReaderMonitor, Transition},
    reader::{PcscContext, PcscTransport, ReaderInfo},
    session::{CardInfo, CardSession, Uid},
    transport::{StatusChange, StatusEvent, Transport},
    utils::{format_hex, parse_hex},
};
