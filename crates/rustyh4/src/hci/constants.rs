//! HCI protocol constants
//!
//! This module contains constants used in the Bluetooth HCI protocol and its
//! H4 framing.

// H4 packet type indicators
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Fixed header sizes following the type byte
pub const HCI_COMMAND_HDR_SIZE: usize = 3;
pub const HCI_ACL_HDR_SIZE: usize = 4;
pub const HCI_SCO_HDR_SIZE: usize = 3;
pub const HCI_EVENT_HDR_SIZE: usize = 2;

// Maximum payload sizes, bounded by the width of each length field
pub const HCI_MAX_PARAM_LEN: usize = 255;
pub const HCI_MAX_ACL_DATA_LEN: usize = 65535;
pub const HCI_MAX_SCO_DATA_LEN: usize = 255;

// Connection handles occupy the low 12 bits of the ACL/SCO handle field
pub const HCI_HANDLE_MASK: u16 = 0x0fff;

// Common OGF (Opcode Group Field) values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;

// Host Controller Commands (OGF: 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;

// Informational Parameters (OGF: 0x04)
pub const OCF_READ_LOCAL_VERSION: u16 = 0x0001;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
