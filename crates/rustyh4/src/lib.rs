//! rustyh4 - Bluetooth HCI over H4 for Unix hosts
//!
//! This library carries the Bluetooth Host Controller Interface over a single
//! byte stream (typically a UART) using H4 framing. An [`AsyncFdWatcher`]
//! turns descriptor readiness into callbacks on a background thread, the
//! [`H4Protocol`] reassembles events, ACL data and SCO data from the stream
//! and frames outbound packets, and [`BluetoothHci`] runs both as one session
//! over a [`Transport`].

pub mod error;
pub mod hci;
pub mod service;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod test_util;

// Re-export common types for convenience
pub use error::{HciError, Result};
pub use hci::{
    H4PacketType, H4Protocol, H4Writer, HciCommand, HciEvent, HciPacket, PacketAssembler,
    PacketCallbacks, Progress,
};
pub use service::{BluetoothHci, DeathRecipient, HciCallbacks, Status};
pub use transport::{SerialTransport, Transport};
pub use watcher::{AsyncFdWatcher, WatchStatus};
