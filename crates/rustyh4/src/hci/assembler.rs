//! Incremental H4 packet assembly
//!
//! The inbound byte stream arrives in arbitrarily sized pieces. The assembler
//! keeps the single packet currently being reconstructed and always asks for
//! exactly the number of bytes the current phase still needs, so one read
//! never consumes bytes belonging to the next phase or the next packet.

use crate::hci::packet::{H4PacketType, HciPacket, PacketLayout};
use std::convert::TryFrom;
use std::io;

/// Where the assembler is within the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssemblyState {
    AwaitingType,
    AwaitingHeader {
        layout: &'static PacketLayout,
        remaining: usize,
    },
    AwaitingPayload {
        layout: &'static PacketLayout,
        remaining: usize,
    },
}

/// Result of feeding one read into the assembler
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed
    Pending,
    /// A packet has been fully assembled; the assembler is reset
    Complete(HciPacket),
    /// The byte was not a valid inbound packet type and has been dropped
    Discarded(u8),
    /// The read returned no data; any partial packet has been dropped
    Closed,
}

/// Reassembles H4 frames from partial reads
#[derive(Debug)]
pub struct PacketAssembler {
    state: AssemblyState,
    /// Header and payload of the packet in flight
    buffer: Vec<u8>,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketAssembler {
    pub fn new() -> Self {
        PacketAssembler {
            state: AssemblyState::AwaitingType,
            buffer: Vec::new(),
        }
    }

    /// Number of bytes still needed to finish the current phase
    pub fn read_len(&self) -> usize {
        match self.state {
            AssemblyState::AwaitingType => 1,
            AssemblyState::AwaitingHeader { remaining, .. }
            | AssemblyState::AwaitingPayload { remaining, .. } => remaining,
        }
    }

    /// True when no partial packet is held
    pub fn is_idle(&self) -> bool {
        self.state == AssemblyState::AwaitingType
    }

    /// Drop any partially assembled packet
    pub fn reset(&mut self) {
        self.state = AssemblyState::AwaitingType;
        self.buffer.clear();
    }

    /// Perform one read and advance the state machine
    ///
    /// `read` is called exactly once with a buffer of [`read_len`] bytes and
    /// returns how many bytes it filled, like [`std::io::Read::read`]. An error
    /// from `read` is returned as is and leaves the assembly state unchanged.
    ///
    /// [`read_len`]: PacketAssembler::read_len
    pub fn fill<F>(&mut self, read: F) -> io::Result<Progress>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.state == AssemblyState::AwaitingType {
            let mut type_byte = [0u8; 1];
            if read(&mut type_byte)? == 0 {
                self.reset();
                return Ok(Progress::Closed);
            }
            return Ok(self.start_packet(type_byte[0]));
        }

        let start = self.buffer.len();
        let wanted = self.read_len();
        self.buffer.resize(start + wanted, 0);

        let received = match read(&mut self.buffer[start..]) {
            Ok(received) => received.min(wanted),
            Err(e) => {
                self.buffer.truncate(start);
                return Err(e);
            }
        };
        self.buffer.truncate(start + received);

        if received == 0 {
            self.reset();
            return Ok(Progress::Closed);
        }

        Ok(self.advance(received))
    }

    fn start_packet(&mut self, type_byte: u8) -> Progress {
        match H4PacketType::try_from(type_byte) {
            // Controllers never send commands to the host
            Ok(H4PacketType::Command) | Err(_) => Progress::Discarded(type_byte),
            Ok(packet_type) => {
                let layout = packet_type.layout();
                self.buffer.clear();
                self.buffer.reserve(layout.header_len);
                self.state = AssemblyState::AwaitingHeader {
                    layout,
                    remaining: layout.header_len,
                };
                Progress::Pending
            }
        }
    }

    fn advance(&mut self, received: usize) -> Progress {
        match self.state {
            AssemblyState::AwaitingType => Progress::Pending,
            AssemblyState::AwaitingHeader { layout, remaining } if received < remaining => {
                self.state = AssemblyState::AwaitingHeader {
                    layout,
                    remaining: remaining - received,
                };
                Progress::Pending
            }
            AssemblyState::AwaitingHeader { layout, .. } => {
                // The header is complete, so the length field is present
                let payload_len = layout.payload_len(&self.buffer).unwrap_or(0);
                if payload_len == 0 {
                    return self.finish(layout);
                }

                self.buffer.reserve(payload_len);
                self.state = AssemblyState::AwaitingPayload {
                    layout,
                    remaining: payload_len,
                };
                Progress::Pending
            }
            AssemblyState::AwaitingPayload { layout, remaining } if received < remaining => {
                self.state = AssemblyState::AwaitingPayload {
                    layout,
                    remaining: remaining - received,
                };
                Progress::Pending
            }
            AssemblyState::AwaitingPayload { layout, .. } => self.finish(layout),
        }
    }

    fn finish(&mut self, layout: &'static PacketLayout) -> Progress {
        let data = std::mem::take(&mut self.buffer);
        self.state = AssemblyState::AwaitingType;

        match HciPacket::from_bytes(layout.packet_type, data) {
            Ok(packet) => Progress::Complete(packet),
            // Unreachable with a consistent layout table
            Err(_) => Progress::Pending,
        }
    }
}
