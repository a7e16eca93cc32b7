use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Choice, Completion, ListUpdate, PeerList, PeerSet, RequestMeta};
use crate::error::ChooseError;
use crate::peer::BenchTransport;
use crate::Result;

#[derive(Debug)]
/// Picks the peer with the fewest pending requests.
///
/// Ties are broken round robin, starting the scan one peer further each time.
pub struct FewestPending {
    set: PeerSet,
    offset: AtomicUsize,
}

impl FewestPending {
    pub fn new(transport: BenchTransport) -> Self {
        FewestPending {
            set: PeerSet::new(transport),
            offset: AtomicUsize::new(0),
        }
    }
}

impl PeerList for FewestPending {
    fn update(&mut self, update: ListUpdate) -> Result<()> {
        self.set.apply(update)
    }

    fn choose(&self, _request: &RequestMeta) -> std::result::Result<Choice, ChooseError> {
        let peers = self.set.peers();
        let len = peers.len();
        if len == 0 {
            return Err(ChooseError::NoPeers);
        }

        let offset = self.offset.fetch_add(1, Ordering::Relaxed);

        let peer = (0..len)
            .map(|i| &peers[(offset + i) % len])
            .min_by_key(|peer| peer.pending())
            .ok_or(ChooseError::NoPeers)?
            .clone();

        Ok(Choice::new(peer.id(), Completion::pending(peer)))
    }
}
