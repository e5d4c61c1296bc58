//! Bluetooth HCI (Host Controller Interface) over H4
//!
//! This module provides the H4 packet model, incremental packet assembly and
//! the protocol layer reading and writing framed packets on a descriptor.

pub mod assembler;
pub mod constants;
pub mod packet;
pub mod protocol;


pub use assembler::{PacketAssembler, Progress};
pub use packet::{H4PacketType, HciCommand, HciEvent, HciPacket, PacketLayout};
pub use protocol::{H4Protocol, H4Writer, PacketCallbacks, SendAbort};
