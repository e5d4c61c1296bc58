//! H4 protocol over a byte stream descriptor
//!
//! [`H4Protocol`] turns readiness notifications into complete HCI packets and
//! hands them to per-type callbacks. Outbound packets are framed and written
//! synchronously, either through the protocol itself or through an
//! [`H4Writer`] which can be shared with other threads while the protocol is
//! owned by the watcher thread.

use crate::error::{HciError, Result};
use crate::hci::assembler::{PacketAssembler, Progress};
use crate::hci::packet::{H4PacketType, HciPacket};
use crate::watcher::{self_pipe, wake, WatchStatus};
use log::{debug, error, trace, warn};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

/// Receives the header and payload of one inbound packet
pub type PacketCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Invoked once when the transport is found to be closed
pub type DisconnectCallback = Box<dyn FnOnce() + Send + 'static>;

/// The callbacks an [`H4Protocol`] dispatches to
pub struct PacketCallbacks {
    pub on_event: PacketCallback,
    pub on_acl: PacketCallback,
    pub on_sco: PacketCallback,
    pub on_disconnect: DisconnectCallback,
}

impl PacketCallbacks {
    pub fn new<E, A, S, D>(on_event: E, on_acl: A, on_sco: S, on_disconnect: D) -> Self
    where
        E: FnMut(&[u8]) + Send + 'static,
        A: FnMut(&[u8]) + Send + 'static,
        S: FnMut(&[u8]) + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        PacketCallbacks {
            on_event: Box::new(on_event),
            on_acl: Box::new(on_acl),
            on_sco: Box::new(on_sco),
            on_disconnect: Box::new(on_disconnect),
        }
    }
}

/// H4 framing on top of an open descriptor
///
/// The descriptor is borrowed: it must stay open for the lifetime of the
/// protocol and is not closed when the protocol is dropped.
pub struct H4Protocol {
    fd: RawFd,
    assembler: PacketAssembler,
    on_event: PacketCallback,
    on_acl: PacketCallback,
    on_sco: PacketCallback,
    on_disconnect: Option<DisconnectCallback>,
    writer: H4Writer,
}

impl H4Protocol {
    pub fn new(fd: RawFd, callbacks: PacketCallbacks) -> Self {
        H4Protocol {
            fd,
            assembler: PacketAssembler::new(),
            on_event: callbacks.on_event,
            on_acl: callbacks.on_acl,
            on_sco: callbacks.on_sco,
            on_disconnect: Some(callbacks.on_disconnect),
            writer: H4Writer::new(fd),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// A handle for sending on this descriptor from other threads
    pub fn writer(&self) -> H4Writer {
        self.writer
    }

    /// Whether the disconnect callback has already fired
    pub fn is_disconnected(&self) -> bool {
        self.on_disconnect.is_none()
    }

    /// Read once from the descriptor and advance packet assembly
    ///
    /// Exactly one `read(2)` is issued, for no more bytes than the current
    /// phase of the packet still needs. A completed packet is dispatched to
    /// the callback for its type. An unexpected type byte is dropped and
    /// parsing resumes with the next byte. End of stream or a read error
    /// fires the disconnect callback once and returns
    /// [`WatchStatus::Detach`].
    pub fn on_packet_ready(&mut self) -> WatchStatus {
        if self.is_disconnected() {
            return WatchStatus::Detach;
        }

        let fd = self.fd;
        match self.assembler.fill(|buffer| read(fd, buffer)) {
            Ok(Progress::Pending) => WatchStatus::Continue,
            Ok(Progress::Complete(packet)) => {
                self.dispatch(&packet);
                WatchStatus::Continue
            }
            Ok(Progress::Discarded(byte)) => {
                warn!("Discarding unexpected H4 packet type {:#04x}", byte);
                WatchStatus::Continue
            }
            Ok(Progress::Closed) => {
                debug!("HCI transport on fd {} closed", fd);
                self.disconnect()
            }
            Err(e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) =>
            {
                WatchStatus::Continue
            }
            Err(e) => {
                error!("{}", HciError::ReceiveError(e));
                self.disconnect()
            }
        }
    }

    fn dispatch(&mut self, packet: &HciPacket) {
        trace!("rx {:?} {}", packet.packet_type(), hex::encode(packet.as_bytes()));

        match packet.packet_type() {
            H4PacketType::Event => (self.on_event)(packet.as_bytes()),
            H4PacketType::AclData => (self.on_acl)(packet.as_bytes()),
            H4PacketType::ScoData => (self.on_sco)(packet.as_bytes()),
            // The assembler never yields inbound commands
            H4PacketType::Command => {}
        }
    }

    fn disconnect(&mut self) -> WatchStatus {
        self.assembler.reset();
        if let Some(on_disconnect) = self.on_disconnect.take() {
            on_disconnect();
        }
        WatchStatus::Detach
    }

    /// Send an HCI command
    pub fn send_command(&self, opcode: u16, params: &[u8]) -> Result<()> {
        self.writer.send_command(opcode, params)
    }

    /// Send ACL data
    pub fn send_acl(&self, handle: u16, payload: &[u8]) -> Result<()> {
        self.writer.send_acl(handle, payload)
    }

    /// Send SCO data
    pub fn send_sco(&self, handle: u16, payload: &[u8]) -> Result<()> {
        self.writer.send_sco(handle, payload)
    }

    /// Send a pre-built packet (header and payload)
    pub fn send_packet(&self, packet_type: H4PacketType, packet: &[u8]) -> Result<()> {
        self.writer.send_packet(packet_type, packet)
    }
}

/// Outbound half of the H4 protocol
///
/// Each send writes one complete frame before returning. Concurrent senders
/// are not serialized against each other.
#[derive(Debug, Clone, Copy)]
pub struct H4Writer {
    fd: RawFd,
    abort: Option<RawFd>,
}

impl H4Writer {
    pub fn new(fd: RawFd) -> Self {
        H4Writer { fd, abort: None }
    }

    /// Give up on a send that is waiting for buffer space once `abort`
    /// becomes readable
    ///
    /// `abort` must stay open for as long as this writer is used.
    pub fn with_abort(self, abort: RawFd) -> Self {
        H4Writer {
            abort: Some(abort),
            ..self
        }
    }

    pub fn send_command(&self, opcode: u16, params: &[u8]) -> Result<()> {
        self.send(&HciPacket::command(opcode, params)?)
    }

    pub fn send_acl(&self, handle: u16, payload: &[u8]) -> Result<()> {
        self.send(&HciPacket::acl(handle, payload)?)
    }

    pub fn send_sco(&self, handle: u16, payload: &[u8]) -> Result<()> {
        self.send(&HciPacket::sco(handle, payload)?)
    }

    /// Send a packet whose header has already been built by the caller
    ///
    /// The header's length field must match the payload that follows it.
    pub fn send_packet(&self, packet_type: H4PacketType, packet: &[u8]) -> Result<()> {
        self.send(&HciPacket::from_bytes(packet_type, packet.to_vec())?)
    }

    /// Frame and write a packet
    pub fn send(&self, packet: &HciPacket) -> Result<()> {
        let frame = packet.to_frame();
        trace!("tx {}", hex::encode(&frame));

        write_all(self.fd, self.abort, &frame).map_err(HciError::SendError)
    }
}

/// Wakes senders blocked on a full descriptor so they can give up
///
/// Once triggered it stays triggered; a new session gets a new one.
#[derive(Debug)]
pub struct SendAbort {
    read: OwnedFd,
    write: OwnedFd,
}

impl SendAbort {
    pub fn new() -> io::Result<Self> {
        let (read, write) = self_pipe()?;
        Ok(SendAbort { read, write })
    }

    /// The descriptor to hand to [`H4Writer::with_abort`]
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn trigger(&self) {
        wake(&self.write);
    }
}

fn read(fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
    let read = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };

    if read < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(read as usize)
}

/// Write the whole buffer, waiting for the descriptor when it would block
fn write_all(fd: RawFd, abort: Option<RawFd>, mut buffer: &[u8]) -> io::Result<()> {
    while !buffer.is_empty() {
        let written =
            unsafe { libc::write(fd, buffer.as_ptr() as *const libc::c_void, buffer.len()) };

        if written < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    wait_writable(fd, abort)?;
                    continue;
                }
                _ => return Err(err),
            }
        }

        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write whole H4 frame",
            ));
        }

        buffer = &buffer[written as usize..];
    }

    Ok(())
}

fn wait_writable(fd: RawFd, abort: Option<RawFd>) -> io::Result<()> {
    let mut poll_fds = [
        libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        },
        libc::pollfd {
            // Negative descriptors are ignored by poll
            fd: abort.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
    ];

    loop {
        if unsafe { libc::poll(poll_fds.as_mut_ptr(), 2, -1) } >= 0 {
            if poll_fds[1].revents != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "send aborted while waiting for the transport",
                ));
            }
            // Errors and hangups are reported by the next write
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
