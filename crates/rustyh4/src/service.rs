//! HCI service shell
//!
//! [`BluetoothHci`] ties a [`Transport`], an [`AsyncFdWatcher`] and an
//! [`H4Protocol`] into one session: it opens the transport, forwards decoded
//! packets to the registered [`HciCallbacks`] and accepts pre-built outbound
//! packets. The session ends on [`BluetoothHci::close`], when the transport
//! reports end of stream, or when a [`DeathRecipient`] observes that the
//! client went away.

use crate::error::{HciError, Result};
use crate::hci::packet::H4PacketType;
use crate::hci::protocol::{H4Protocol, H4Writer, PacketCallbacks, SendAbort};
use crate::transport::Transport;
use crate::watcher::AsyncFdWatcher;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Outcome of [`BluetoothHci::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    TransportError,
    InitializationError,
}

/// Receives everything the controller sends during a session
///
/// Packet callbacks run on the watcher thread and get the HCI header followed
/// by the payload, without the H4 type byte.
pub trait HciCallbacks: Send + Sync {
    fn initialization_complete(&self, status: Status);
    fn hci_event_received(&self, event: &[u8]);
    fn acl_data_received(&self, data: &[u8]);
    fn sco_data_received(&self, data: &[u8]);

    /// The transport reached end of stream; the session is being closed
    fn transport_closed(&self) {}
}

struct Session {
    fd: RawFd,
    writer: H4Writer,
    /// Held for a whole frame so frames from different senders never interleave
    sending: Mutex<()>,
    abort: SendAbort,
}

/// One HCI session over an H4 transport
pub struct BluetoothHci {
    transport: Mutex<Box<dyn Transport>>,
    watcher: AsyncFdWatcher,
    /// Senders hold a read guard for the duration of a write; closing takes
    /// the write guard, so the descriptor is never closed mid-frame
    session: RwLock<Option<Session>>,
}

impl BluetoothHci {
    pub fn new<T: Transport + 'static>(transport: T) -> Arc<Self> {
        Arc::new(BluetoothHci {
            transport: Mutex::new(Box::new(transport)),
            watcher: AsyncFdWatcher::new(),
            session: RwLock::new(None),
        })
    }

    /// Open the transport and start delivering packets to `callbacks`
    ///
    /// `callbacks.initialization_complete` is always told the outcome.
    pub fn initialize(self: &Arc<Self>, callbacks: Arc<dyn HciCallbacks>) -> Result<()> {
        let mut session = self.session.write();
        if session.is_some() {
            return Err(HciError::AlreadyRunning);
        }

        let abort = match SendAbort::new() {
            Ok(abort) => abort,
            Err(e) => {
                error!("Failed to set up HCI session: {}", e);
                callbacks.initialization_complete(Status::InitializationError);
                return Err(e.into());
            }
        };

        let fd = match self.transport.lock().open() {
            Ok(fd) => fd,
            Err(e) => {
                error!("Failed to open HCI transport: {}", e);
                callbacks.initialization_complete(Status::TransportError);
                return Err(e);
            }
        };

        let protocol = H4Protocol::new(fd, self.packet_callbacks(&callbacks));
        *session = Some(Session {
            fd,
            writer: protocol.writer().with_abort(abort.fd()),
            sending: Mutex::new(()),
            abort,
        });
        drop(session);

        if let Err(e) = self.start_watching(fd, protocol) {
            error!("Failed to watch HCI transport: {}", e);
            self.close();
            callbacks.initialization_complete(Status::InitializationError);
            return Err(e);
        }

        info!("HCI session started on fd {}", fd);
        callbacks.initialization_complete(Status::Success);
        Ok(())
    }

    fn packet_callbacks(self: &Arc<Self>, callbacks: &Arc<dyn HciCallbacks>) -> PacketCallbacks {
        let events = callbacks.clone();
        let acl = callbacks.clone();
        let sco = callbacks.clone();
        let closed = callbacks.clone();
        let service = Arc::downgrade(self);

        PacketCallbacks::new(
            move |packet: &[u8]| events.hci_event_received(packet),
            move |packet: &[u8]| acl.acl_data_received(packet),
            move |packet: &[u8]| sco.sco_data_received(packet),
            move || {
                warn!("HCI transport disconnected");
                closed.transport_closed();
                if let Some(service) = service.upgrade() {
                    service.close();
                }
            },
        )
    }

    fn start_watching(&self, fd: RawFd, mut protocol: H4Protocol) -> Result<()> {
        self.watcher.initialize()?;
        self.watcher
            .watch_fd_for_non_blocking_reads(fd, move |_| protocol.on_packet_ready())
    }

    /// Whether a session is currently open
    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    /// Send a command packet (opcode, length and parameters)
    pub fn send_hci_command(&self, packet: &[u8]) -> Result<()> {
        self.send(H4PacketType::Command, packet)
    }

    /// Send an ACL data packet (handle, length and data)
    pub fn send_acl_data(&self, packet: &[u8]) -> Result<()> {
        self.send(H4PacketType::AclData, packet)
    }

    /// Send an SCO data packet (handle, length and data)
    pub fn send_sco_data(&self, packet: &[u8]) -> Result<()> {
        self.send(H4PacketType::ScoData, packet)
    }

    fn send(&self, packet_type: H4PacketType, packet: &[u8]) -> Result<()> {
        let session = self.session.read();
        let session = session.as_ref().ok_or(HciError::NotRunning)?;

        let _frame = session.sending.lock();
        session.writer.send_packet(packet_type, packet)
    }

    /// Arm the session's one-shot timeout, replacing any pending one
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.watcher.set_timeout(delay, callback)
    }

    pub fn clear_timeout(&self) {
        self.watcher.clear_timeout();
    }

    /// End the session: stop watching, then close the transport
    ///
    /// Sends stalled on a transport that stopped draining are aborted first
    /// and fail with [`HciError::SendError`].
    pub fn close(&self) {
        if let Some(session) = self.session.read().as_ref() {
            session.abort.trigger();
        }
        let session = self.session.write().take();

        self.watcher.stop();
        self.transport.lock().close();

        if let Some(session) = session {
            info!("HCI session on fd {} closed", session.fd);
        }
    }

    /// An observer that closes this session when the client goes away
    pub fn death_recipient(self: &Arc<Self>) -> DeathRecipient {
        DeathRecipient {
            service: Arc::downgrade(self),
        }
    }
}

impl Drop for BluetoothHci {
    fn drop(&mut self) {
        self.close();
    }
}

/// Closes the session when the client it serves is gone
#[derive(Clone)]
pub struct DeathRecipient {
    service: Weak<BluetoothHci>,
}

impl DeathRecipient {
    pub fn service_died(&self) {
        if let Some(service) = self.service.upgrade() {
            warn!("HCI client died, closing session");
            service.close();
        }
    }
}
