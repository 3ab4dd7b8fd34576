//! Post-accept routing: keep the connection or hand it to its owner.
//!
//! Routing returns an explicit outcome the worker loop matches on; a
//! forwarded or aborted connection simply sends the thread back to the
//! accept window, and nothing here ever touches a connection after its
//! ownership has moved.

use crate::connection::Connection;
use crate::error::Result;
use crate::processor::ConnectionProcessor;
use crate::routing::RoutingTable;
use crate::worker::handoff;
use std::sync::Arc;

/// What became of an accepted connection.
#[derive(Debug)]
pub enum RouteOutcome {
    /// This process is the authorized owner; serve it here.
    Local(Connection),
    /// Ownership was transferred to the bound process.
    Forwarded,
    /// The connection could not be routed and was dropped.
    Aborted,
}

/// Decides ownership of freshly accepted connections for one process.
pub struct ConnectionRouter {
    routing: Arc<RoutingTable>,
    /// Routing entry this process serves.
    own_entry: usize,
}

impl ConnectionRouter {
    pub fn new(routing: Arc<RoutingTable>, own_entry: usize) -> Self {
        Self { routing, own_entry }
    }

    /// Route a locally accepted connection.
    pub fn route(
        &self,
        mut conn: Connection,
        processor: &dyn ConnectionProcessor,
    ) -> RouteOutcome {
        let hint = match processor.identity_hint(&mut conn) {
            Ok(hint) => hint,
            Err(e) => {
                tracing::warn!(error = %e, "identity sniff failed, dropping connection");
                return RouteOutcome::Aborted;
            }
        };

        let target = self.routing.entry_for(hint);
        if target == self.own_entry {
            if let Err(e) = conn.apply_socket_options() {
                tracing::debug!(error = %e, "could not set socket options");
            }
            return RouteOutcome::Local(conn);
        }

        let entry = self.routing.entry(target);
        match handoff::send_handoff(entry.send_stream(), conn.stream(), conn.unconsumed()) {
            Ok(()) => {
                tracing::debug!(
                    entry = target,
                    identity = ?entry.identity(),
                    peer = ?conn.peer_addr(),
                    prefix_len = conn.unconsumed().len(),
                    "forwarded connection to owning process"
                );
                // Dropping conn here is the sender discarding its copy.
                RouteOutcome::Forwarded
            }
            Err(e) => {
                tracing::warn!(entry = target, error = %e, "handoff failed, dropping connection");
                RouteOutcome::Aborted
            }
        }
    }

    /// Receive a connection forwarded to this process and restore it to
    /// the state a local accept would have produced.
    pub fn receive(&self) -> Result<Connection> {
        let entry = self.routing.entry(self.own_entry);
        let (stream, prefix) = handoff::recv_handoff(entry.recv_stream())?;
        let conn = Connection::forwarded(stream, prefix);
        if let Err(e) = conn.apply_socket_options() {
            tracing::debug!(error = %e, "could not set socket options on forwarded connection");
        }
        Ok(conn)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::BroodError;
    use crate::identity::Identity;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    /// Hint stub: peeks a fixed number of bytes, then reports a fixed
    /// identity.
    struct FixedHint {
        peek: usize,
        identity: Option<Identity>,
        fail: bool,
    }

    impl ConnectionProcessor for FixedHint {
        fn identity_hint(&self, conn: &mut Connection) -> Result<Option<Identity>> {
            if self.fail {
                return Err(BroodError::Handoff("sniff exploded".into()));
            }
            if self.peek > 0 {
                conn.peek(self.peek)?;
            }
            Ok(self.identity)
        }

        fn process(&self, _conn: &mut Connection) -> Result<()> {
            Ok(())
        }
    }

    fn table_with_binding() -> Arc<RoutingTable> {
        let cfg = ServerConfig::parse(
            r#"
            max_processes = 2
            [[identity]]
            uid = 1000
            gid = 1000
            "#,
        )
        .unwrap();
        Arc::new(RoutingTable::build(&cfg).unwrap())
    }

    fn accepted_conn() -> (TcpStream, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (client, Connection::accepted(server, peer))
    }

    #[test]
    fn test_matching_identity_stays_local() {
        let routing = table_with_binding();
        let bound = routing.entry_for(Some(Identity::new(1000, 1000)));
        let router = ConnectionRouter::new(routing, bound);

        let (_client, conn) = accepted_conn();
        let hint = FixedHint {
            peek: 0,
            identity: Some(Identity::new(1000, 1000)),
            fail: false,
        };
        assert!(matches!(router.route(conn, &hint), RouteOutcome::Local(_)));
    }

    #[test]
    fn test_no_hint_falls_back_to_default_entry() {
        let routing = table_with_binding();
        let router = ConnectionRouter::new(routing, crate::routing::DEFAULT_ENTRY);

        let (_client, conn) = accepted_conn();
        let hint = FixedHint {
            peek: 0,
            identity: None,
            fail: false,
        };
        assert!(matches!(router.route(conn, &hint), RouteOutcome::Local(_)));
    }

    #[test]
    fn test_mismatched_identity_is_forwarded_with_prefix() {
        let routing = table_with_binding();
        let bound = routing.entry_for(Some(Identity::new(1000, 1000)));

        // This router runs in the default-entry process; the connection
        // wants the bound identity.
        let sender = ConnectionRouter::new(routing.clone(), crate::routing::DEFAULT_ENTRY);
        let receiver = ConnectionRouter::new(routing, bound);

        let (mut client, conn) = accepted_conn();
        client.write_all(b"hello forwarding").unwrap();
        client.flush().unwrap();

        let hint = FixedHint {
            peek: 5,
            identity: Some(Identity::new(1000, 1000)),
            fail: false,
        };
        assert!(matches!(sender.route(conn, &hint), RouteOutcome::Forwarded));

        let mut got = receiver.receive().unwrap();
        drop(client);
        let mut all = Vec::new();
        got.read_to_end(&mut all).unwrap();
        assert_eq!(all, b"hello forwarding");
    }

    #[test]
    fn test_failed_sniff_aborts() {
        let routing = table_with_binding();
        let router = ConnectionRouter::new(routing, crate::routing::DEFAULT_ENTRY);
        let (_client, conn) = accepted_conn();
        let hint = FixedHint {
            peek: 0,
            identity: None,
            fail: true,
        };
        assert!(matches!(router.route(conn, &hint), RouteOutcome::Aborted));
    }
}
