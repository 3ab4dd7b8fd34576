//! Shutdown-signal channel shared by the whole fleet.
//!
//! A single pipe, created before the first fork and inherited by every
//! worker. For a graceful restart the supervisor writes one poison byte per
//! live worker process; inside each process exactly one thread claims one
//! byte and latches the pool exit flag. A thread that polls the pipe
//! readable but reads nothing lost the race to a peer process and keeps
//! serving.

use crate::error::Result;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd::{pipe2, read, write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// The byte broadcast to ask one worker process to wind down.
const POISON: u8 = b'!';

/// At-least-once single-byte broadcast primitive.
#[derive(Debug)]
pub struct ShutdownChannel {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl ShutdownChannel {
    /// Create the pipe. Both ends are non-blocking: readers must be able to
    /// lose a consume race without hanging, and the writer retries rather
    /// than blocks.
    pub fn new() -> Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_NONBLOCK)?;
        Ok(Self {
            read_end,
            write_end,
        })
    }

    /// Descriptor worker threads include in their multiplexed wait set.
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    /// Deliver exactly one poison byte per target process, retrying
    /// interrupted or refused writes so no process is skipped.
    pub fn broadcast(&self, processes: usize) -> Result<()> {
        let byte = [POISON];
        let mut delivered = 0;
        while delivered < processes {
            match write(&self.write_end, &byte) {
                Ok(1) => delivered += 1,
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Attempt to claim one poison byte. `Ok(true)` means this process won
    /// and must wind down; `Ok(false)` means a peer process consumed the
    /// byte first.
    pub fn try_consume(&self) -> Result<bool> {
        let mut buf = [0u8; 1];
        loop {
            match read(&self.read_end, &mut buf) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
