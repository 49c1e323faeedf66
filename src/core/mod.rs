pub mod apdu;
pub mod atr;
pub mod config;
pub mod error;
pub mod history;
pub mod monitor;
pub mod reader;
pub mod session;
pub mod transport;
pub mod utils;
