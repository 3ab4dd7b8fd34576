//! The seam between the pool machinery and whatever actually speaks the
//! application protocol.
//!
//! The supervisor and pools know nothing about requests. They hand every
//! accepted connection to a [`ConnectionProcessor`], which is expected to
//! fully drain or close it. The processor also surfaces the identity a
//! connection declares it needs, which drives routing.

use crate::connection::Connection;
use crate::error::Result;
use crate::identity::Identity;
use std::io::Read;

/// Application-protocol collaborator.
pub trait ConnectionProcessor: Send + Sync {
    /// Inspect the start of the connection and report which identity it
    /// must be served under, or `None` when it has no preference.
    ///
    /// Implementations may only `peek` at the connection; bytes they pull
    /// off the wire stay in the connection's prefix buffer and are never
    /// lost to a later handoff.
    fn identity_hint(&self, conn: &mut Connection) -> Result<Option<Identity>>;

    /// Serve the connection to completion.
    fn process(&self, conn: &mut Connection) -> Result<()>;
}

/// Placeholder processor: no identity preference, drains and drops.
///
/// Real deployments wire in their own protocol implementation; this keeps
/// the daemon runnable stand-alone.
#[derive(Debug, Default)]
pub struct DrainProcessor;

impl ConnectionProcessor for DrainProcessor {
    fn identity_hint(&self, _conn: &mut Connection) -> Result<Option<Identity>> {
        Ok(None)
    }

    fn process(&self, conn: &mut Connection) -> Result<()> {
        let mut sink = [0u8; 4096];
        while conn.read(&mut sink)? > 0 {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_drain_processor_consumes_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();

        client.write_all(&[7u8; 8192]).unwrap();
        drop(client);

        let mut conn = Connection::accepted(server, peer);
        let proc = DrainProcessor;
        assert!(proc.identity_hint(&mut conn).unwrap().is_none());
        proc.process(&mut conn).unwrap();
    }
}
