//! HCI packet structures and H4 framing
//!
//! This module contains the H4 packet type tags, the per-type header layouts
//! and the owned packet representation shared by the inbound and outbound
//! paths.

use crate::error::{HciError, Result};
use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use std::convert::TryFrom;

/// H4 packet type indicator, the first byte of every frame on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum H4PacketType {
    Command = HCI_COMMAND_PKT,
    AclData = HCI_ACL_PKT,
    ScoData = HCI_SCO_PKT,
    Event = HCI_EVENT_PKT,
}

impl H4PacketType {
    /// The header layout that follows this type byte
    pub fn layout(self) -> &'static PacketLayout {
        match self {
            Self::Command => &COMMAND_LAYOUT,
            Self::AclData => &ACL_LAYOUT,
            Self::ScoData => &SCO_LAYOUT,
            Self::Event => &EVENT_LAYOUT,
        }
    }
}

impl TryFrom<u8> for H4PacketType {
    type Error = HciError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            HCI_COMMAND_PKT => Ok(Self::Command),
            HCI_ACL_PKT => Ok(Self::AclData),
            HCI_SCO_PKT => Ok(Self::ScoData),
            HCI_EVENT_PKT => Ok(Self::Event),
            other => Err(HciError::UnknownPacketType(other)),
        }
    }
}

impl From<H4PacketType> for u8 {
    fn from(packet_type: H4PacketType) -> u8 {
        packet_type as u8
    }
}

/// Fixed header description for one packet type
///
/// Every H4 header ends with its payload length field, but the field width
/// differs: ACL data carries a 16-bit length while commands, events and SCO
/// data use a single byte.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketLayout {
    pub packet_type: H4PacketType,
    pub header_len: usize,
    pub length_offset: usize,
    pub length_width: usize,
    pub max_payload: usize,
}

static COMMAND_LAYOUT: PacketLayout = PacketLayout {
    packet_type: H4PacketType::Command,
    header_len: HCI_COMMAND_HDR_SIZE,
    length_offset: 2,
    length_width: 1,
    max_payload: HCI_MAX_PARAM_LEN,
};

static ACL_LAYOUT: PacketLayout = PacketLayout {
    packet_type: H4PacketType::AclData,
    header_len: HCI_ACL_HDR_SIZE,
    length_offset: 2,
    length_width: 2,
    max_payload: HCI_MAX_ACL_DATA_LEN,
};

static SCO_LAYOUT: PacketLayout = PacketLayout {
    packet_type: H4PacketType::ScoData,
    header_len: HCI_SCO_HDR_SIZE,
    length_offset: 2,
    length_width: 1,
    max_payload: HCI_MAX_SCO_DATA_LEN,
};

static EVENT_LAYOUT: PacketLayout = PacketLayout {
    packet_type: H4PacketType::Event,
    header_len: HCI_EVENT_HDR_SIZE,
    length_offset: 1,
    length_width: 1,
    max_payload: HCI_MAX_PARAM_LEN,
};

impl PacketLayout {
    /// Read the payload length field out of a complete header
    ///
    /// Returns `None` if `header` is shorter than this layout's header.
    pub fn payload_len(&self, header: &[u8]) -> Option<usize> {
        let field = header.get(self.length_offset..self.length_offset + self.length_width)?;

        Some(match self.length_width {
            1 => field[0] as usize,
            _ => LittleEndian::read_u16(field) as usize,
        })
    }

    /// Write `len` into the length field of `header`
    fn write_payload_len(&self, header: &mut [u8], len: usize) {
        let field = &mut header[self.length_offset..self.length_offset + self.length_width];

        match self.length_width {
            1 => field[0] = len as u8,
            _ => LittleEndian::write_u16(field, len as u16),
        }
    }
}

/// A complete HCI packet without its H4 type byte
///
/// `data` holds the type-specific header followed by the payload, which is
/// exactly what the per-type callbacks of the protocol layer receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket {
    packet_type: H4PacketType,
    data: Vec<u8>,
}

impl HciPacket {
    /// Build a packet from the fields preceding the length and the payload
    ///
    /// `prefix` is the opcode, connection handle or event code; the length
    /// field is filled in from the layout.
    fn build(packet_type: H4PacketType, prefix: &[u8], payload: &[u8]) -> Result<Self> {
        let layout = packet_type.layout();
        if payload.len() > layout.max_payload {
            return Err(HciError::PayloadTooLong {
                packet_type,
                len: payload.len(),
                max: layout.max_payload,
            });
        }

        let mut data = vec![0u8; layout.header_len];
        data[..prefix.len()].copy_from_slice(prefix);
        layout.write_payload_len(&mut data, payload.len());
        data.extend_from_slice(payload);

        Ok(HciPacket { packet_type, data })
    }

    /// Create an HCI command packet from an opcode and its parameters
    pub fn command(opcode: u16, params: &[u8]) -> Result<Self> {
        Self::build(H4PacketType::Command, &opcode.to_le_bytes(), params)
    }

    /// Create an ACL data packet for a connection handle (including PB/BC flags)
    pub fn acl(handle: u16, payload: &[u8]) -> Result<Self> {
        Self::build(H4PacketType::AclData, &handle.to_le_bytes(), payload)
    }

    /// Create an SCO data packet for a connection handle
    pub fn sco(handle: u16, payload: &[u8]) -> Result<Self> {
        Self::build(H4PacketType::ScoData, &handle.to_le_bytes(), payload)
    }

    /// Create an HCI event packet
    pub fn event(event_code: u8, params: &[u8]) -> Result<Self> {
        Self::build(H4PacketType::Event, &[event_code], params)
    }

    /// Wrap already-assembled header and payload bytes
    ///
    /// The header must be complete and its length field must match the
    /// number of payload bytes that follow it.
    pub fn from_bytes(packet_type: H4PacketType, data: Vec<u8>) -> Result<Self> {
        let layout = packet_type.layout();
        let payload_len = layout
            .payload_len(&data)
            .ok_or(HciError::InvalidPacketFormat)?;

        if data.len() != layout.header_len + payload_len {
            return Err(HciError::InvalidPacketFormat);
        }

        Ok(HciPacket { packet_type, data })
    }

    /// Parse exactly one H4 frame, type byte included
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let (&type_byte, rest) = frame.split_first().ok_or(HciError::InvalidPacketFormat)?;
        Self::from_bytes(H4PacketType::try_from(type_byte)?, rest.to_vec())
    }

    pub fn packet_type(&self) -> H4PacketType {
        self.packet_type
    }

    /// Header and payload, without the type byte
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn header(&self) -> &[u8] {
        &self.data[..self.packet_type.layout().header_len]
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.packet_type.layout().header_len..]
    }

    /// Command opcode, for command packets
    pub fn opcode(&self) -> Option<u16> {
        match self.packet_type {
            H4PacketType::Command => Some(LittleEndian::read_u16(&self.data[..2])),
            _ => None,
        }
    }

    /// Connection handle with the flag bits masked off, for ACL and SCO packets
    pub fn handle(&self) -> Option<u16> {
        match self.packet_type {
            H4PacketType::AclData | H4PacketType::ScoData => {
                Some(LittleEndian::read_u16(&self.data[..2]) & HCI_HANDLE_MASK)
            }
            _ => None,
        }
    }

    /// Event code, for event packets
    pub fn event_code(&self) -> Option<u8> {
        match self.packet_type {
            H4PacketType::Event => Some(self.data[0]),
            _ => None,
        }
    }

    /// Serialize to an H4 frame: type byte, header, payload
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.data.len());
        frame.push(self.packet_type.into());
        frame.extend_from_slice(&self.data);
        frame
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Common HCI Commands
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HciCommand {
    // Host Controller Commands (OGF: 0x03)
    Reset,
    SetEventMask { event_mask: u64 },

    // Informational Parameters (OGF: 0x04)
    ReadLocalVersionInformation,
    ReadBdAddr,

    /// Any other command, given by its opcode parts
    Raw { ogf: u8, ocf: u16, params: Vec<u8> },
}

impl HciCommand {
    /// Create a raw command
    pub fn new(ogf: u8, ocf: u16, params: Vec<u8>) -> Self {
        Self::Raw { ogf, ocf, params }
    }

    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Reset => (OGF_HOST_CTL, OCF_RESET),
            Self::SetEventMask { .. } => (OGF_HOST_CTL, OCF_SET_EVENT_MASK),
            Self::ReadLocalVersionInformation => (OGF_INFO_PARAM, OCF_READ_LOCAL_VERSION),
            Self::ReadBdAddr => (OGF_INFO_PARAM, OCF_READ_BD_ADDR),
            Self::Raw { ogf, ocf, .. } => (*ogf, *ocf),
        }
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match self {
            Self::Reset | Self::ReadLocalVersionInformation | Self::ReadBdAddr => vec![],
            Self::SetEventMask { event_mask } => event_mask.to_le_bytes().to_vec(),
            Self::Raw { params, .. } => params.clone(),
        }
    }

    /// Convert the command to an HCI command packet
    pub fn to_packet(&self) -> Result<HciPacket> {
        HciPacket::command(self.opcode(), &self.parameters())
    }
}

/// Combine an OGF and OCF into a command opcode
pub fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

/// HCI Event packet
#[derive(Debug, Clone)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from its header and parameters
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVENT_HDR_SIZE {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];

        let end = parameter_total_length as usize + HCI_EVENT_HDR_SIZE;
        if data.len() < end {
            return None;
        }

        let parameters = data[HCI_EVENT_HDR_SIZE..end].to_vec();

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters,
        })
    }

    /// Opcode of the command this Command Complete or Command Status refers to
    pub fn command_opcode(&self) -> Option<u16> {
        let bytes = match self.event_code {
            EVT_CMD_COMPLETE => self.parameters.get(1..3)?,
            EVT_CMD_STATUS => self.parameters.get(2..4)?,
            _ => return None,
        };
        Some(LittleEndian::read_u16(bytes))
    }

    /// Check whether this is the Command Complete event for the given command
    pub fn is_command_complete(&self, ogf: u8, ocf: u16) -> bool {
        self.event_code == EVT_CMD_COMPLETE && self.command_opcode() == Some(opcode(ogf, ocf))
    }

    /// Status byte of a Command Complete or Command Status event
    ///
    /// Returns 0xFF when the event carries no status.
    pub fn status(&self) -> u8 {
        let status = match self.event_code {
            EVT_CMD_COMPLETE => self.parameters.get(3),
            EVT_CMD_STATUS => self.parameters.first(),
            _ => None,
        };
        status.copied().unwrap_or(0xFF)
    }
}

impl TryFrom<&HciPacket> for HciEvent {
    type Error = HciError;

    fn try_from(packet: &HciPacket) -> Result<Self> {
        match packet.packet_type() {
            H4PacketType::Event => {
                Self::parse(packet.as_bytes()).ok_or(HciError::InvalidPacketFormat)
            }
            _ => Err(HciError::InvalidPacketFormat),
        }
    }
}
