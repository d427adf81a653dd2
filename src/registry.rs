use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::{fmt, sync::Arc};

/// A peer identifier together with the addresses it advertises.
///
/// Produced by a node once its endpoint is listening; immutable afterward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl fmt::Display for AddrRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}:", self.peer_id)?;
        for addr in &self.addrs {
            write!(f, " {}", addr)?;
        }
        write!(f, "}}")
    }
}

/// Append-only list of every started node's address record, consulted by
/// later-starting nodes to find peers to bootstrap against.
///
/// Cloning is cheap; clones share the same underlying list.
#[derive(Clone, Default)]
pub struct BootstrapRegistry {
    records: Arc<RwLock<Vec<AddrRecord>>>,
}

impl BootstrapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records are never removed during a run.
    pub fn append(&self, record: AddrRecord) {
        self.records.write().push(record);
    }

    /// A consistent copy of the current records. A bootstrap pass works from
    /// one snapshot and never observes a partial append.
    pub fn snapshot(&self) -> Vec<AddrRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;

    fn record(port: u16) -> AddrRecord {
        AddrRecord {
            peer_id: PeerId::random(),
            addrs: vec![format!("/ip4/127.0.0.1/tcp/{}", port).parse().unwrap()],
        }
    }

    #[test]
    fn appends_preserve_order() {
        let registry = BootstrapRegistry::new();
        assert!(registry.is_empty());

        let first = record(1000);
        let second = record(1001);
        registry.append(first.clone());
        registry.append(second.clone());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot(), vec![first, second]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_appends() {
        let registry = BootstrapRegistry::new();
        registry.append(record(1000));

        let snapshot = registry.snapshot();
        registry.append(record(1001));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn clones_share_the_same_list() {
        let registry = BootstrapRegistry::new();
        let clone = registry.clone();

        registry.append(record(1000));

        assert_eq!(clone.len(), 1);
    }
}
