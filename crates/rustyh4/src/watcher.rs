//! Asynchronous file descriptor watcher
//!
//! [`AsyncFdWatcher`] owns one background thread that blocks in `poll(2)` over
//! a self-pipe and every registered descriptor, invoking the registered
//! callback whenever a descriptor becomes readable. It also provides a single
//! one-shot timeout that fires on the same thread.
//!
//! The wait set lives on the background thread only. Callers push
//! registration changes and shutdown requests through a channel and then write
//! one byte into the self-pipe so that a blocked `poll` wakes up and picks the
//! change up before waiting again.

use crate::error::{HciError, Result};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// What the watcher should do with a descriptor after its callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    /// Keep watching the descriptor
    Continue,
    /// Stop watching the descriptor
    Detach,
}

/// Callback invoked on the watcher thread when a descriptor is readable
pub type ReadCallback = Box<dyn FnMut(RawFd) -> WatchStatus + Send + 'static>;

/// Callback invoked on the watcher thread when the timeout expires
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Watch(RawFd, ReadCallback),
    Unwatch(RawFd),
    /// A `None` deadline is too far away to represent and never fires
    SetTimeout(Option<Instant>, TimeoutCallback),
    ClearTimeout,
    Stop,
}

/// Handles held by the caller side while the watcher thread is alive
struct Running {
    commands: Sender<Command>,
    wake: OwnedFd,
    stopping: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl Running {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| HciError::NotRunning)?;
        wake(&self.wake);
        Ok(())
    }
}

/// Watches file descriptors for readability on a background thread
///
/// All read and timeout callbacks run sequentially on that thread. The
/// watcher can be started and stopped any number of times.
pub struct AsyncFdWatcher {
    running: Mutex<Option<Running>>,
}

impl Default for AsyncFdWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncFdWatcher {
    /// Create a stopped watcher
    pub fn new() -> Self {
        AsyncFdWatcher {
            running: Mutex::new(None),
        }
    }

    /// Create the self-pipe and start the background thread
    ///
    /// Fails with [`HciError::AlreadyRunning`] if the watcher has been started
    /// and not stopped since.
    pub fn initialize(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(HciError::AlreadyRunning);
        }

        let (wake_rx, wake_tx) = self_pipe()?;
        let (commands, receiver) = channel::unbounded();
        let stopping = Arc::new(AtomicBool::new(false));
        let thread_stopping = stopping.clone();
        let worker = thread::Builder::new()
            .name("h4-fd-watcher".into())
            .spawn(move || WatcherThread::new(wake_rx, receiver, thread_stopping).run())?;

        *running = Some(Running {
            commands,
            wake: wake_tx,
            stopping,
            worker,
        });

        debug!("fd watcher started");
        Ok(())
    }

    /// Whether the background thread has been started
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Register `fd` for read readiness notifications
    ///
    /// `callback` runs on the watcher thread each time `poll` reports the
    /// descriptor readable (or hung up), so it must consume data or return
    /// [`WatchStatus::Detach`] to avoid being invoked again for the same
    /// bytes. Registering an already watched descriptor replaces its callback.
    pub fn watch_fd_for_non_blocking_reads<F>(&self, fd: RawFd, callback: F) -> Result<()>
    where
        F: FnMut(RawFd) -> WatchStatus + Send + 'static,
    {
        if fd < 0 {
            return Err(HciError::InvalidDescriptor(fd));
        }

        self.send(Command::Watch(fd, Box::new(callback)))
    }

    /// Deregister `fd`; does nothing if it is not watched
    pub fn stop_watching_file_descriptor(&self, fd: RawFd) {
        // Nothing is watched while stopped
        let _ = self.send(Command::Unwatch(fd));
    }

    /// Arm the one-shot timeout, replacing any pending one
    ///
    /// A delay too large to be represented as a deadline never fires, but
    /// still replaces the pending timeout.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now().checked_add(delay);
        self.send(Command::SetTimeout(deadline, Box::new(callback)))
    }

    /// Disarm the pending timeout, if any
    pub fn clear_timeout(&self) {
        let _ = self.send(Command::ClearTimeout);
    }

    /// Stop the background thread and drop all registrations
    ///
    /// Once this returns no callback will run. When it is called from a
    /// callback on the watcher thread itself, the thread exits as soon as the
    /// current callback returns, without dispatching other ready descriptors
    /// or the timeout.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        running.stopping.store(true, Ordering::SeqCst);
        // A send failure means the thread is already gone
        let _ = running.send(Command::Stop);

        if running.worker.thread().id() == thread::current().id() {
            debug!("fd watcher stop requested from its own thread");
            return;
        }

        if running.worker.join().is_err() {
            error!("fd watcher thread panicked");
        }
        debug!("fd watcher stopped");
    }

    fn send(&self, command: Command) -> Result<()> {
        match self.running.lock().as_ref() {
            Some(running) => running.send(command),
            None => Err(HciError::NotRunning),
        }
    }
}

impl Drop for AsyncFdWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Registration {
    fd: RawFd,
    callback: ReadCallback,
}

/// State owned by the background thread
struct WatcherThread {
    wake: OwnedFd,
    commands: Receiver<Command>,
    /// Kept in registration order; callbacks are dispatched in this order
    registrations: Vec<Registration>,
    timeout: Option<(Option<Instant>, TimeoutCallback)>,
    /// Set by `stop` before it queues `Command::Stop`
    stopping: Arc<AtomicBool>,
}

impl WatcherThread {
    fn new(wake: OwnedFd, commands: Receiver<Command>, stopping: Arc<AtomicBool>) -> Self {
        WatcherThread {
            wake,
            commands,
            registrations: Vec::new(),
            timeout: None,
            stopping,
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        let mut poll_fds = Vec::new();

        while self.apply_commands() {
            poll_fds.clear();
            poll_fds.push(poll_fd(self.wake.as_raw_fd()));
            poll_fds.extend(self.registrations.iter().map(|r| poll_fd(r.fd)));

            let ready = match poll(&mut poll_fds, self.poll_timeout()) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("fd watcher poll failed: {}", e);
                    self.abandon_registrations();
                    break;
                }
            };

            if poll_fds[0].revents != 0 {
                self.drain_wake();
                continue;
            }

            if ready > 0 {
                self.dispatch(&poll_fds[1..]);
            }

            // A callback may have stopped the watcher
            if self.is_stopping() {
                break;
            }

            self.fire_expired_timeout();
        }

        trace!("fd watcher thread exiting");
    }

    /// Apply queued commands; returns false once the thread should exit
    fn apply_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Watch(fd, callback)) => {
                    match self.registrations.iter_mut().find(|r| r.fd == fd) {
                        Some(registration) => registration.callback = callback,
                        None => self.registrations.push(Registration { fd, callback }),
                    }
                    trace!("watching fd {}", fd);
                }
                Ok(Command::Unwatch(fd)) => {
                    self.registrations.retain(|r| r.fd != fd);
                    trace!("stopped watching fd {}", fd);
                }
                Ok(Command::SetTimeout(deadline, callback)) => {
                    self.timeout = Some((deadline, callback));
                }
                Ok(Command::ClearTimeout) => self.timeout = None,
                Ok(Command::Stop) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    /// Milliseconds until the pending deadline, rounded up, or -1 for none
    fn poll_timeout(&self) -> libc::c_int {
        match &self.timeout {
            Some((Some(deadline), _)) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let millis = (remaining.as_nanos() + 999_999) / 1_000_000;
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
            Some((None, _)) | None => -1,
        }
    }

    fn dispatch(&mut self, polled: &[libc::pollfd]) {
        let mut detached = Vec::new();
        let stopping = &self.stopping;

        for (registration, polled) in self.registrations.iter_mut().zip(polled) {
            if stopping.load(Ordering::SeqCst) {
                break;
            }

            if polled.revents & libc::POLLNVAL != 0 {
                warn!("fd {} is not open, no longer watching it", registration.fd);
                detached.push(registration.fd);
            } else if polled.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                && (registration.callback)(registration.fd) == WatchStatus::Detach
            {
                detached.push(registration.fd);
            }
        }

        if !detached.is_empty() {
            self.registrations.retain(|r| !detached.contains(&r.fd));
        }
    }

    /// Give every registration one last callback, then forget them all
    ///
    /// Used when the wait itself can no longer be performed. Each callback
    /// gets to inspect its descriptor and run its own end-of-stream or error
    /// handling before the thread exits.
    fn abandon_registrations(&mut self) {
        for mut registration in self.registrations.drain(..) {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            warn!("fd watcher giving up on fd {}", registration.fd);
            (registration.callback)(registration.fd);
        }
    }

    fn fire_expired_timeout(&mut self) {
        if !matches!(&self.timeout, Some((Some(deadline), _)) if *deadline <= Instant::now()) {
            return;
        }

        if let Some((_, callback)) = self.timeout.take() {
            trace!("fd watcher timeout expired");
            callback();
        }
    }

    fn drain_wake(&self) {
        let mut buffer = [0u8; 64];
        loop {
            let read = unsafe {
                libc::read(
                    self.wake.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if read <= 0 {
                break;
            }
        }
    }
}

fn poll_fd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Wait for readiness; an interrupted wait reports nothing ready
fn poll(fds: &mut [libc::pollfd], timeout: libc::c_int) -> io::Result<usize> {
    let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if ready >= 0 {
        return Ok(ready as usize);
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        for fd in fds.iter_mut() {
            fd.revents = 0;
        }
        return Ok(0);
    }
    Err(err)
}

/// Create the non-blocking (read, write) ends of the wakeup pipe
pub(crate) fn self_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn wake(fd: &OwnedFd) {
    let byte = 1u8;
    // A full pipe already guarantees a pending wakeup
    unsafe {
        libc::write(fd.as_raw_fd(), &byte as *const u8 as *const libc::c_void, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{pipe, write_all};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_initialize_twice_fails() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        assert!(matches!(watcher.initialize(), Err(HciError::AlreadyRunning)));
        watcher.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let watcher = AsyncFdWatcher::new();

        // Stopping a watcher that never started is fine
        watcher.stop();
        assert!(!watcher.is_running());

        for _ in 0..3 {
            watcher.initialize().unwrap();
            assert!(watcher.is_running());
            watcher.stop();
            watcher.stop();
            assert!(!watcher.is_running());
        }
    }

    #[test]
    fn test_registration_errors() {
        let watcher = AsyncFdWatcher::new();
        let (rx, _tx) = pipe();

        let result =
            watcher.watch_fd_for_non_blocking_reads(rx.as_raw_fd(), |_| WatchStatus::Continue);
        assert!(matches!(result, Err(HciError::NotRunning)));

        watcher.initialize().unwrap();
        let result = watcher.watch_fd_for_non_blocking_reads(-1, |_| WatchStatus::Continue);
        assert!(matches!(result, Err(HciError::InvalidDescriptor(-1))));

        // Unknown descriptors are ignored
        watcher.stop_watching_file_descriptor(1234);
    }

    #[test]
    fn test_read_callback_receives_data() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (rx, tx) = pipe();
        let (sender, receiver) = channel::unbounded();

        watcher
            .watch_fd_for_non_blocking_reads(rx.as_raw_fd(), move |fd| {
                let mut buffer = [0u8; 16];
                let read = unsafe {
                    libc::read(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len())
                };
                if read > 0 {
                    sender.send(buffer[..read as usize].to_vec()).unwrap();
                }
                WatchStatus::Continue
            })
            .unwrap();

        write_all(&tx, &[0x04, 0x0E]);
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), vec![0x04, 0x0E]);

        write_all(&tx, &[0xAA]);
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), vec![0xAA]);

        watcher.stop();
    }

    #[test]
    fn test_detach_stops_callbacks() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (rx, tx) = pipe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        // The data is never drained, so without the detach this would spin
        watcher
            .watch_fd_for_non_blocking_reads(rx.as_raw_fd(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                WatchStatus::Detach
            })
            .unwrap();

        write_all(&tx, &[0x01]);
        thread::sleep(Duration::from_millis(100));
        write_all(&tx, &[0x02]);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn test_stop_watching_file_descriptor() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (rx, tx) = pipe();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        watcher
            .watch_fd_for_non_blocking_reads(rx.as_raw_fd(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                WatchStatus::Continue
            })
            .unwrap();
        watcher.stop_watching_file_descriptor(rx.as_raw_fd());

        // Give the watcher thread a chance to apply the removal
        thread::sleep(Duration::from_millis(50));
        write_all(&tx, &[0x01]);
        thread::sleep(Duration::from_millis(100));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        watcher.stop();
    }

    #[test]
    fn test_timeout_fires_after_delay() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let delay = Duration::from_millis(50);
        let (sender, receiver) = channel::unbounded();
        let start = Instant::now();

        watcher
            .set_timeout(delay, move || sender.send(start.elapsed()).unwrap())
            .unwrap();

        let elapsed = receiver.recv_timeout(WAIT).unwrap();
        assert!(elapsed >= delay, "timeout fired early after {:?}", elapsed);

        // One-shot
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());
        watcher.stop();
    }

    #[test]
    fn test_timeout_last_write_wins() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (sender, receiver) = channel::unbounded();
        let first = sender.clone();

        watcher
            .set_timeout(Duration::from_millis(300), move || first.send("first").unwrap())
            .unwrap();
        watcher
            .set_timeout(Duration::from_millis(20), move || sender.send("second").unwrap())
            .unwrap();

        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "second");
        assert!(receiver.recv_timeout(Duration::from_millis(500)).is_err());
        watcher.stop();
    }

    #[test]
    fn test_clear_timeout() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (sender, receiver) = channel::unbounded::<()>();
        watcher
            .set_timeout(Duration::from_millis(50), move || sender.send(()).unwrap())
            .unwrap();
        watcher.clear_timeout();

        assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
        watcher.stop();
    }

    #[test]
    fn test_stop_cancels_timeout() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (sender, receiver) = channel::unbounded::<()>();
        watcher
            .set_timeout(Duration::from_millis(100), move || sender.send(()).unwrap())
            .unwrap();
        watcher.stop();

        thread::sleep(Duration::from_millis(200));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_stop_from_callback() {
        let watcher = Arc::new(AsyncFdWatcher::new());
        watcher.initialize().unwrap();

        let (rx, tx) = pipe();
        let (sender, receiver) = channel::unbounded::<()>();
        let inner = watcher.clone();

        watcher
            .watch_fd_for_non_blocking_reads(rx.as_raw_fd(), move |_| {
                inner.stop();
                sender.send(()).unwrap();
                WatchStatus::Continue
            })
            .unwrap();

        write_all(&tx, &[0x01]);
        receiver.recv_timeout(WAIT).unwrap();
        assert!(!watcher.is_running());

        // The watcher can be brought back up afterwards
        watcher.initialize().unwrap();
        watcher.stop();
    }

    #[test]
    fn test_stop_from_callback_skips_rest_of_wake() {
        let watcher = Arc::new(AsyncFdWatcher::new());
        watcher.initialize().unwrap();

        let (first_rx, first_tx) = pipe();
        let (second_rx, second_tx) = pipe();

        let (stopped_tx, stopped_rx) = channel::unbounded::<()>();
        let inner = watcher.clone();
        watcher
            .watch_fd_for_non_blocking_reads(first_rx.as_raw_fd(), move |_| {
                inner.stop();
                // Let the timeout expire before the callback returns
                thread::sleep(Duration::from_millis(100));
                stopped_tx.send(()).unwrap();
                WatchStatus::Continue
            })
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        watcher
            .watch_fd_for_non_blocking_reads(second_rx.as_raw_fd(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                WatchStatus::Continue
            })
            .unwrap();

        let (timeout_tx, timeout_rx) = channel::unbounded::<()>();
        watcher
            .set_timeout(Duration::from_millis(30), move || timeout_tx.send(()).unwrap())
            .unwrap();
        write_all(&first_tx, &[0x01]);
        write_all(&second_tx, &[0x02]);

        stopped_rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(timeout_rx.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!watcher.is_running());
    }

    #[test]
    fn test_unrepresentable_timeout_never_fires() {
        let watcher = AsyncFdWatcher::new();
        watcher.initialize().unwrap();

        let (sender, receiver) = channel::unbounded();
        let far = sender.clone();
        watcher
            .set_timeout(Duration::MAX, move || far.send("far").unwrap())
            .unwrap();
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

        // It is still replaced like any other timeout
        watcher
            .set_timeout(Duration::from_millis(20), move || sender.send("near").unwrap())
            .unwrap();
        assert_eq!(receiver.recv_timeout(WAIT).unwrap(), "near");
        assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

        watcher.stop();
    }

    #[test]
    fn test_abandoned_registrations_get_a_last_callback() {
        let (wake_rx, _wake_tx) = self_pipe().unwrap();
        let (_commands, receiver) = channel::unbounded();
        let mut worker = WatcherThread::new(wake_rx, receiver, Arc::new(AtomicBool::new(false)));

        let (rx, tx) = pipe();
        drop(tx);
        let (sender, seen) = channel::unbounded();
        worker.registrations.push(Registration {
            fd: rx.as_raw_fd(),
            callback: Box::new(move |fd| {
                let mut byte = 0u8;
                let read = unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
                sender.send(read).unwrap();
                WatchStatus::Continue
            }),
        });

        worker.abandon_registrations();

        // The callback saw end of stream on its descriptor
        assert_eq!(seen.try_recv().unwrap(), 0);
        assert!(seen.try_recv().is_err());
        assert!(worker.registrations.is_empty());
    }
}
