//! Error types for the rustyh4 library
//!
//! This module defines the error types used throughout the library.

use crate::hci::packet::H4PacketType;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors that can occur when working with an H4 transport
#[derive(Error, Debug)]
pub enum HciError {
    #[error("Failed to open HCI transport: {0}")]
    DescriptorError(std::io::Error),

    #[error("Invalid file descriptor: {0}")]
    InvalidDescriptor(RawFd),

    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Watcher is not running")]
    NotRunning,

    #[error("Failed to send HCI packet: {0}")]
    SendError(std::io::Error),

    #[error("Failed to receive HCI packet: {0}")]
    ReceiveError(std::io::Error),

    #[error("Unknown H4 packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("{packet_type:?} payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLong {
        packet_type: H4PacketType,
        len: usize,
        max: usize,
    },

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with `HciError`.
pub type Result<T> = std::result::Result<T, HciError>;
