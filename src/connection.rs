//! An accepted connection with a replayable prefix buffer.
//!
//! The routing decision may need to inspect the first bytes of a
//! connection before anyone knows which process will serve it. Bytes
//! consumed for that inspection are kept in a prefix buffer: if the
//! connection stays local they are replayed to the processor, and if it is
//! forwarded they travel with the descriptor so the owning process sees the
//! exact byte stream that arrived on the wire.

#![allow(dead_code)] // Some methods exist for connection processors

use crate::error::Result;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};

/// A connection plus any bytes already read off it.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
    pos: usize,
    peer: Option<SocketAddr>,
}

impl Connection {
    /// Wrap a locally accepted stream.
    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            pos: 0,
            peer: Some(peer),
        }
    }

    /// Reconstruct a connection received via handoff: `prefix` holds the
    /// bytes the original acceptor consumed before forwarding.
    pub fn forwarded(stream: TcpStream, prefix: Vec<u8>) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            buffer: prefix,
            pos: 0,
            peer,
        }
    }

    /// Grow the prefix buffer to at least `min` bytes without consuming
    /// them, reading from the stream as needed. Returns the buffered bytes;
    /// fewer than `min` means the peer closed early.
    pub fn peek(&mut self, min: usize) -> Result<&[u8]> {
        while self.buffer.len() - self.pos < min {
            let mut chunk = [0u8; 4096];
            let n = (&self.stream).read(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
        Ok(&self.buffer[self.pos..])
    }

    /// Bytes read off the wire but not yet consumed by the processor.
    /// These are what a handoff must carry.
    pub fn unconsumed(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Apply the socket options a freshly accepted connection gets.
    /// Called both after a local accept and after a handoff arrival.
    pub fn apply_socket_options(&self) -> Result<()> {
        self.stream.set_nodelay(true)?;
        Ok(())
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buffer.len() {
            let available = &self.buffer[self.pos..];
            let n = available.len().min(buf.len());
            buf[..n].copy_from_slice(&available[..n]);
            self.pos += n;
            if self.pos == self.buffer.len() {
                self.buffer.clear();
                self.pos = 0;
            }
            return Ok(n);
        }
        self.stream.read(buf)
    }
}
