use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Identity of a connected real-time peer. UI clients and the device link are
/// registered symmetrically.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct PeerId(usize);

static LAST_PEER_ID: AtomicUsize = AtomicUsize::new(0);

impl PeerId {
    fn next() -> Self {
        let id = LAST_PEER_ID.fetch_add(1, Ordering::SeqCst);
        PeerId(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// The set of currently attached peers. Each peer is an unbounded channel of
/// serialized frames; the transport layer owns the receiving half and pumps
/// frames into the actual socket.
///
/// Fan-out is best-effort: a failed delivery never aborts delivery to the
/// remaining peers, and the failing peer is dropped from the registry before
/// `broadcast` returns, so dead connections cannot accumulate.
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, flume::Sender<String>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&self, tx: flume::Sender<String>) -> PeerId {
        let id = PeerId::next();
        self.peers.lock().unwrap().insert(id, tx);
        debug!("registered {}", id);
        id
    }

    pub fn unregister(&self, id: PeerId) -> bool {
        let removed = self.peers.lock().unwrap().remove(&id).is_some();
        if removed {
            debug!("unregistered {}", id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `frame` to every registered peer except `exclude`, returning
    /// the number of successful deliveries. The peer set is snapshotted up
    /// front, so peers attaching mid-broadcast are unaffected.
    pub fn broadcast(&self, frame: &str, exclude: Option<PeerId>) -> usize {
        let snapshot: Vec<(PeerId, flume::Sender<String>)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();

        for (id, tx) in snapshot {
            if tx.send(frame.to_owned()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut peers = self.peers.lock().unwrap();
            for id in dead {
                warn!("dropping {}: channel closed during broadcast", id);
                peers.remove(&id);
            }
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_all_registered_peers() {
        let registry = Registry::new();
        let (tx_a, rx_a) = flume::unbounded();
        let (tx_b, rx_b) = flume::unbounded();
        registry.register(tx_a);
        registry.register(tx_b);

        assert_eq!(registry.broadcast("hello", None), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
    }

    #[test]
    fn dead_peer_is_removed_without_aborting_fanout() {
        let registry = Registry::new();
        let (tx_dead, rx_dead) = flume::unbounded();
        let (tx_live, rx_live) = flume::unbounded();
        registry.register(tx_dead);
        registry.register(tx_live);
        drop(rx_dead);

        assert_eq!(registry.broadcast("still here?", None), 1);
        assert_eq!(rx_live.try_recv().unwrap(), "still here?");
        // the dead peer is gone before broadcast returned
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn exclude_skips_the_origin_peer() {
        let registry = Registry::new();
        let (tx_origin, rx_origin) = flume::unbounded();
        let (tx_other, rx_other) = flume::unbounded();
        let origin = registry.register(tx_origin);
        registry.register(tx_other);

        assert_eq!(registry.broadcast("echo?", Some(origin)), 1);
        assert!(rx_origin.try_recv().is_err());
        assert_eq!(rx_other.try_recv().unwrap(), "echo?");
    }

    #[test]
    fn unregister_removes_only_the_named_peer() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = flume::unbounded();
        let (tx_b, _rx_b) = flume::unbounded();
        let a = registry.register(tx_a);
        registry.register(tx_b);

        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));
        assert_eq!(registry.len(), 1);
    }
}
