//! Accept-window serialization.
//!
//! Before a thread may sit in the accept window it takes, in order, the
//! intra-process accept turn (a plain mutex held by the pool) and the
//! cross-process accept turn (an flock on a shared lock file, one holder
//! across the whole fleet). Holding both, it waits on the multiplexed set
//! of wakeup sources. The cross-process lock is released immediately after
//! accept so a peer process can start waiting while this one goes off to
//! process the connection.

use crate::error::{BroodError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::{File, OpenOptions};
use std::io;
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;

/// Why the multiplexed wait woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEvent {
    /// The shutdown-signal channel is readable.
    Shutdown,
    /// This process latched its exit flag and kicked its local wake pipe.
    LocalWake,
    /// A forwarded connection is waiting on this process's routing socket.
    Routed,
    /// The listener at this index has a connection to accept.
    Listener(usize),
}

/// Fleet-wide accept mutex backed by an flock'd file.
///
/// Each worker process opens the lock file itself after fork: flock
/// ownership follows the open file description, so sharing the parent's
/// descriptor would make every process one holder.
#[derive(Debug)]
pub struct CrossProcessLock {
    file: Option<File>,
}

impl CrossProcessLock {
    /// Open this process's handle on the lock file. `None` disables the
    /// cross-process half (single-process deployments).
    pub fn child_init(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            None => None,
            Some(p) => Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(p)
                    .map_err(|e| {
                        BroodError::Setup(format!(
                            "cannot open accept lock {}: {}",
                            p.display(),
                            e
                        ))
                    })?,
            ),
        };
        Ok(Self { file })
    }

    /// Block until this process holds the fleet-wide accept turn.
    pub fn acquire(&self) -> Result<CrossProcessGuard<'_>> {
        if let Some(file) = &self.file {
            let fd = file.as_raw_fd();
            loop {
                if unsafe { libc::flock(fd, libc::LOCK_EX) } == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
        }
        Ok(CrossProcessGuard { lock: self })
    }
}

/// Held cross-process accept turn; released on drop.
#[derive(Debug)]
pub struct CrossProcessGuard<'a> {
    lock: &'a CrossProcessLock,
}

impl Drop for CrossProcessGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.lock.file {
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

/// Wait, interruptibly and indefinitely, for the next wakeup source.
///
/// `last_listener` rotates which listener gets served first so that a busy
/// listener cannot starve the others; it is updated to the serviced index.
pub fn wait_for_event(
    shutdown_fd: BorrowedFd<'_>,
    wake_fd: BorrowedFd<'_>,
    routing_fd: BorrowedFd<'_>,
    listeners: &[TcpListener],
    last_listener: &mut usize,
) -> Result<WaitEvent> {
    loop {
        let mut fds = Vec::with_capacity(3 + listeners.len());
        fds.push(PollFd::new(shutdown_fd, PollFlags::POLLIN));
        fds.push(PollFd::new(wake_fd, PollFlags::POLLIN));
        fds.push(PollFd::new(routing_fd, PollFlags::POLLIN));
        for listener in listeners {
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }

        if readable(&fds[0]) {
            return Ok(WaitEvent::Shutdown);
        }
        if readable(&fds[1]) {
            return Ok(WaitEvent::LocalWake);
        }
        if readable(&fds[2]) {
            return Ok(WaitEvent::Routed);
        }

        let n = listeners.len();
        for offset in 1..=n {
            let idx = (*last_listener + offset) % n;
            if readable(&fds[3 + idx]) {
                *last_listener = idx;
                return Ok(WaitEvent::Listener(idx));
            }
        }
        // Spurious wakeup: wait again.
    }
}

fn readable(fd: &PollFd) -> bool {
    fd.revents().is_some_and(|r| {
        r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::shutdown::ShutdownChannel;
    use std::io::Write;
    use std::net::TcpStream;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_noop_lock_always_acquires() {
        let lock = CrossProcessLock::child_init(None).unwrap();
        let _g1 = lock.acquire().unwrap();
    }

    /// The fleet-wide mutual-exclusion property: with two independently
    /// opened handles on the same lock file (as two worker processes would
    /// have), at most one holder exists at any instant.
    #[test]
    fn test_cross_process_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.lock");

        let holders = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let path = path.clone();
            let holders = holders.clone();
            handles.push(std::thread::spawn(move || {
                let lock = CrossProcessLock::child_init(Some(&path)).unwrap();
                for _ in 0..25 {
                    let guard = lock.acquire().unwrap();
                    let before = holders.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before, 0, "two holders inside the accept window");
                    std::thread::sleep(Duration::from_micros(200));
                    holders.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_wait_reports_shutdown_first() {
        let channel = ShutdownChannel::new().unwrap();
        let wake = ShutdownChannel::new().unwrap();
        channel.broadcast(1).unwrap();
        let (routed_recv, mut routed_send) = UnixStream::pair().unwrap();
        routed_send.write_all(b"x").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let listeners = vec![listener];

        let mut last = 0;
        let event = wait_for_event(
            channel.read_fd(),
            wake.read_fd(),
            routed_recv.as_fd(),
            &listeners,
            &mut last,
        )
        .unwrap();
        assert_eq!(event, WaitEvent::Shutdown);
    }

    #[test]
    fn test_wait_reports_local_wake() {
        let channel = ShutdownChannel::new().unwrap();
        let wake = ShutdownChannel::new().unwrap();
        wake.broadcast(1).unwrap();
        let (routed_recv, _routed_send) = UnixStream::pair().unwrap();
        let listeners = vec![TcpListener::bind("127.0.0.1:0").unwrap()];

        let mut last = 0;
        let event = wait_for_event(
            channel.read_fd(),
            wake.read_fd(),
            routed_recv.as_fd(),
            &listeners,
            &mut last,
        )
        .unwrap();
        assert_eq!(event, WaitEvent::LocalWake);
    }

    #[test]
    fn test_wait_reports_routed_connection() {
        let channel = ShutdownChannel::new().unwrap();
        let wake = ShutdownChannel::new().unwrap();
        let (routed_recv, mut routed_send) = UnixStream::pair().unwrap();
        routed_send.write_all(b"x").unwrap();
        let listeners = vec![TcpListener::bind("127.0.0.1:0").unwrap()];

        let mut last = 0;
        let event = wait_for_event(
            channel.read_fd(),
            wake.read_fd(),
            routed_recv.as_fd(),
            &listeners,
            &mut last,
        )
        .unwrap();
        assert_eq!(event, WaitEvent::Routed);
    }

    #[test]
    fn test_listeners_are_served_round_robin() {
        let channel = ShutdownChannel::new().unwrap();
        let wake = ShutdownChannel::new().unwrap();
        let (routed_recv, _routed_send) = UnixStream::pair().unwrap();

        let listeners = vec![
            TcpListener::bind("127.0.0.1:0").unwrap(),
            TcpListener::bind("127.0.0.1:0").unwrap(),
        ];
        // Make both listeners readable.
        let _c0 = TcpStream::connect(listeners[0].local_addr().unwrap()).unwrap();
        let _c1 = TcpStream::connect(listeners[1].local_addr().unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut last = 0;
        let first = wait_for_event(
            channel.read_fd(),
            wake.read_fd(),
            routed_recv.as_fd(),
            &listeners,
            &mut last,
        )
        .unwrap();
        assert_eq!(first, WaitEvent::Listener(1), "scan starts after the last serviced");

        let second = wait_for_event(
            channel.read_fd(),
            wake.read_fd(),
            routed_recv.as_fd(),
            &listeners,
            &mut last,
        )
        .unwrap();
        assert_eq!(second, WaitEvent::Listener(0));
    }
}
