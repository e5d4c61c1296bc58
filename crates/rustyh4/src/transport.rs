//! Transport acquisition
//!
//! The H4 layer only needs an open descriptor. A [`Transport`] is the
//! collaborator that produces one at session start and closes it at session
//! end; setting up the underlying hardware is left to the implementation.

use crate::error::HciError;
use log::debug;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Supplies the descriptor an HCI session runs on
pub trait Transport: Send {
    /// Open the transport, returning a descriptor suitable for non-blocking reads
    fn open(&mut self) -> Result<RawFd, HciError>;

    /// Close the descriptor returned by `open`; must be safe to call repeatedly
    fn close(&mut self);
}

/// A character device or other path speaking H4, such as a UART tty
#[derive(Debug)]
pub struct SerialTransport {
    path: PathBuf,
    fd: Option<RawFd>,
}

impl SerialTransport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        SerialTransport {
            path: path.as_ref().to_path_buf(),
            fd: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the raw file descriptor, if open
    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.fd
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<RawFd, HciError> {
        if let Some(fd) = self.fd {
            return Ok(fd);
        }

        let path = CString::new(self.path.as_os_str().as_bytes()).map_err(|e| {
            HciError::DescriptorError(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };

        if fd < 0 {
            return Err(HciError::DescriptorError(std::io::Error::last_os_error()));
        }

        debug!("Opened HCI transport {} as fd {}", self.path.display(), fd);
        self.fd = Some(fd);
        Ok(fd)
    }

    fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
            debug!("Closed HCI transport {}", self.path.display());
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let mut transport = SerialTransport::new("/nonexistent/ttyHCI0");

        assert!(matches!(transport.open(), Err(HciError::DescriptorError(_))));
        assert_eq!(transport.as_raw_fd(), None);

        // Closing an unopened transport is harmless
        transport.close();
    }

    #[test]
    fn test_open_and_close() {
        let mut transport = SerialTransport::new("/dev/null");

        let fd = transport.open().unwrap();
        assert!(fd >= 0);
        assert_eq!(transport.open().unwrap(), fd);
        assert_eq!(transport.path(), Path::new("/dev/null"));

        transport.close();
        transport.close();
        assert_eq!(transport.as_raw_fd(), None);
    }
}
