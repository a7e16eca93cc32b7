use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Choice, Completion, ListUpdate, PeerList, PeerSet, RequestMeta};
use crate::error::ChooseError;
use crate::peer::BenchTransport;
use crate::Result;

#[derive(Debug)]
/// Cycles through peers in membership order.
pub struct RoundRobin {
    set: PeerSet,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(transport: BenchTransport) -> Self {
        RoundRobin {
            set: PeerSet::new(transport),
            next: AtomicUsize::new(0),
        }
    }
}

impl PeerList for RoundRobin {
    fn update(&mut self, update: ListUpdate) -> Result<()> {
        self.set.apply(update)
    }

    fn choose(&self, _request: &RequestMeta) -> std::result::Result<Choice, ChooseError> {
        let peers = self.set.peers();
        if peers.is_empty() {
            return Err(ChooseError::NoPeers);
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % peers.len();
        let peer = peers[index].clone();

        Ok(Choice::new(peer.id(), Completion::pending(peer)))
    }
}
