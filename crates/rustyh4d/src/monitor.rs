//! Logs controller traffic and tracks the startup reset.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::Sender;
use log::{debug, error, info, warn};
use rustyh4::hci::constants::{OCF_RESET, OGF_HOST_CTL};
use rustyh4::{H4PacketType, HciCallbacks, HciEvent, HciPacket, Status};

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    TransportClosed,
    ResetTimedOut,
}

/// Logs every packet the controller sends.
pub struct PacketLogger {
    reset_pending: AtomicBool,
    end: Sender<SessionEnd>,
}

impl PacketLogger {
    pub fn new(end: Sender<SessionEnd>) -> Self {
        Self {
            reset_pending: AtomicBool::new(false),
            end,
        }
    }

    /// Marks an HCI Reset as sent and awaiting Command Complete.
    pub fn reset_sent(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::SeqCst)
    }

    /// Called when the reset deadline passes.
    pub fn reset_deadline_expired(&self) {
        if self.reset_pending.swap(false, Ordering::SeqCst) {
            error!("Controller did not answer HCI Reset");
            let _ = self.end.try_send(SessionEnd::ResetTimedOut);
        }
    }

    fn log_data(kind: H4PacketType, data: &[u8]) {
        match HciPacket::from_bytes(kind, data.to_vec()) {
            Ok(packet) => debug!(
                "{:?} handle {:#06x}: {}",
                kind,
                packet.handle().unwrap_or_default(),
                hex::encode(packet.payload())
            ),
            Err(e) => warn!("Malformed {:?} packet: {}", kind, e),
        }
    }
}

impl HciCallbacks for PacketLogger {
    fn initialization_complete(&self, status: Status) {
        match status {
            Status::Success => info!("HCI transport ready"),
            other => error!("HCI initialization failed: {:?}", other),
        }
    }

    fn hci_event_received(&self, event: &[u8]) {
        let Some(event) = HciEvent::parse(event) else {
            warn!("Malformed HCI event: {}", hex::encode(event));
            return;
        };

        debug!(
            "Event {:#04x}: {}",
            event.event_code,
            hex::encode(&event.parameters)
        );

        if event.is_command_complete(OGF_HOST_CTL, OCF_RESET)
            && self.reset_pending.swap(false, Ordering::SeqCst)
        {
            info!("Controller reset complete, status {:#04x}", event.status());
        }
    }

    fn acl_data_received(&self, data: &[u8]) {
        Self::log_data(H4PacketType::AclData, data);
    }

    fn sco_data_received(&self, data: &[u8]) {
        Self::log_data(H4PacketType::ScoData, data);
    }

    fn transport_closed(&self) {
        let _ = self.end.try_send(SessionEnd::TransportClosed);
    }
}
