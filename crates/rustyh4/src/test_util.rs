//! Descriptor helpers shared by the unit tests

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A blocking (read, write) pipe
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// A connected pair of stream sockets
pub fn socketpair() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn set_nonblocking(fd: &OwnedFd) {
    let raw = fd.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        assert!(flags >= 0);
        assert_eq!(libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
    }
}

pub fn write_all(fd: &OwnedFd, data: &[u8]) {
    let written =
        unsafe { libc::write(fd.as_raw_fd(), data.as_ptr() as *const libc::c_void, data.len()) };
    assert_eq!(written, data.len() as isize);
}

/// Read whatever is available, up to `max` bytes
pub fn read_some(fd: &OwnedFd, max: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; max];
    let read = unsafe { libc::read(fd.as_raw_fd(), buffer.as_mut_ptr() as *mut libc::c_void, max) };
    assert!(read >= 0);
    buffer.truncate(read as usize);
    buffer
}
