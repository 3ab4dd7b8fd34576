//! Static routing table: owner identity -> process slot + routing sockets.
//!
//! Built once at startup, before the first fork, so every worker process
//! inherits every socket pair. Entry 0 is always the default entry:
//! connections whose identity has no explicit binding are silently served
//! there rather than rejected.

use crate::config::ServerConfig;
use crate::error::Result;
use crate::identity::Identity;
use std::collections::HashMap;
use std::os::unix::net::UnixStream;

/// One routing destination: an identity (None for the default entry) and
/// the connected socket pair used to forward connections to whichever
/// process serves that identity.
#[derive(Debug)]
pub struct RoutingEntry {
    identity: Option<Identity>,
    /// End polled by the bound worker process.
    recv: UnixStream,
    /// End written by any process forwarding a connection here.
    send: UnixStream,
}

impl RoutingEntry {
    fn new(identity: Option<Identity>) -> Result<Self> {
        let (recv, send) = UnixStream::pair()?;
        Ok(Self {
            identity,
            recv,
            send,
        })
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn recv_stream(&self) -> &UnixStream {
        &self.recv
    }

    pub fn send_stream(&self) -> &UnixStream {
        &self.send
    }
}

/// Identity -> routing entry and process slot -> routing entry mappings.
#[derive(Debug)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
    by_identity: HashMap<Identity, usize>,
    /// Routing entry index for each process slot.
    slot_entries: Vec<usize>,
}

/// Index of the default (unassigned) routing entry.
pub const DEFAULT_ENTRY: usize = 0;

impl RoutingTable {
    /// Build the table from configured identity bindings.
    ///
    /// Socket pairs are created exactly once per distinct identity; two
    /// bindings naming the same uid:gid share an entry. Slots are assigned
    /// to bindings in declaration order, and slots beyond the bound count
    /// use the default entry.
    pub fn build(cfg: &ServerConfig) -> Result<Self> {
        let mut entries = vec![RoutingEntry::new(None)?];
        let mut by_identity = HashMap::new();
        let mut slot_entries = Vec::with_capacity(cfg.max_processes);

        for binding in &cfg.identities {
            let identity = Identity::new(binding.uid, binding.gid);
            let entry = match by_identity.get(&identity) {
                Some(&idx) => idx,
                None => {
                    entries.push(RoutingEntry::new(Some(identity))?);
                    let idx = entries.len() - 1;
                    by_identity.insert(identity, idx);
                    idx
                }
            };
            for _ in 0..binding.processes {
                if slot_entries.len() < cfg.max_processes {
                    slot_entries.push(entry);
                }
            }
        }
        while slot_entries.len() < cfg.max_processes {
            slot_entries.push(DEFAULT_ENTRY);
        }

        Ok(Self {
            entries,
            by_identity,
            slot_entries,
        })
    }

    pub fn entry(&self, index: usize) -> &RoutingEntry {
        &self.entries[index]
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Routing entry serving `identity`; unknown or absent identities fall
    /// back to the default entry.
    pub fn entry_for(&self, identity: Option<Identity>) -> usize {
        identity
            .and_then(|id| self.by_identity.get(&id).copied())
            .unwrap_or(DEFAULT_ENTRY)
    }

    /// Routing entry a given process slot serves.
    pub fn slot_entry(&self, slot: usize) -> usize {
        self.slot_entries[slot]
    }
}
