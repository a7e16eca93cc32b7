//! Benchmark peers, their identifiers and the stub transport retaining them.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Dense integer identifier of a virtual server, in `[0, server_count)`.
///
/// Doubles as the index of the server's queue in the [crate::fabric::Fabric].
pub struct PeerId(usize);

impl PeerId {
    pub fn new(index: usize) -> Self {
        PeerId(index)
    }

    /// Index of this peer in the fabric and in per destination counters.
    pub fn index(&self) -> usize {
        self.0
    }

    /// All identifiers for a population of `count` peers.
    pub fn range(count: usize) -> impl Iterator<Item = PeerId> {
        (0..count).map(PeerId)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl From<usize> for PeerId {
    fn from(index: usize) -> Self {
        PeerId(index)
    }
}

#[derive(Debug)]
/// A peer as seen by one chooser.
///
/// Tracks the number of requests sent to it whose completion has not fired yet.
pub struct BenchPeer {
    id: PeerId,
    pending: AtomicI64,
}

impl BenchPeer {
    pub fn new(id: PeerId) -> Self {
        BenchPeer {
            id,
            pending: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Current number of pending requests.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Runs when a request is routed to this peer.
    pub fn start_request(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs from the completion of a request routed to this peer.
    pub fn end_request(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
/// Stub transport handed to selection algorithms.
///
/// There is no connection to manage, retaining a peer only hands out a shared
/// [BenchPeer] so that every retainer sees the same pending count.
pub struct BenchTransport {
    peers: HashMap<PeerId, Arc<BenchPeer>>,
}

impl BenchTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the peer for `id`, creating it on first use.
    pub fn retain_peer(&mut self, id: PeerId) -> Arc<BenchPeer> {
        self.peers
            .entry(id)
            .or_insert_with(|| Arc::new(BenchPeer::new(id)))
            .clone()
    }

    /// Forget a peer, returns `false` if it was never retained.
    pub fn release_peer(&mut self, id: PeerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
