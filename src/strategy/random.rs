use rand::Rng;

use super::{Choice, Completion, ListUpdate, PeerList, PeerSet, RequestMeta};
use crate::error::ChooseError;
use crate::peer::BenchTransport;
use crate::Result;

#[derive(Debug)]
/// Picks a peer uniformly at random.
pub struct RandomPeer {
    set: PeerSet,
}

impl RandomPeer {
    pub fn new(transport: BenchTransport) -> Self {
        RandomPeer {
            set: PeerSet::new(transport),
        }
    }
}

impl PeerList for RandomPeer {
    fn update(&mut self, update: ListUpdate) -> Result<()> {
        self.set.apply(update)
    }

    fn choose(&self, _request: &RequestMeta) -> std::result::Result<Choice, ChooseError> {
        let peers = self.set.peers();
        if peers.is_empty() {
            return Err(ChooseError::NoPeers);
        }

        let peer = peers[rand::thread_rng().gen_range(0..peers.len())].clone();

        Ok(Choice::new(peer.id(), Completion::pending(peer)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer::PeerId;

    #[test]
    fn covers_every_peer() {
        let mut list = RandomPeer::new(BenchTransport::new());
        list.update(ListUpdate {
            additions: PeerId::range(3).collect(),
            removals: vec![],
        })
        .expect("update");

        let mut seen = [0; 3];
        for _ in 0..300 {
            let choice = list.choose(&RequestMeta { client_id: 0 }).expect("peer");
            seen[choice.peer().index()] += 1;
        }

        assert!(seen.iter().all(|count| *count > 0), "{seen:?}");
    }
}
