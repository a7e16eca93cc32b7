use super::{ListUpdate, Membership, PeerList};
use crate::peer::PeerId;
use crate::Result;

#[derive(Debug, Clone, Copy)]
/// Every server is a member, for the whole run.
pub struct StaticMembership {
    peer_count: usize,
}

impl StaticMembership {
    pub fn new(peer_count: usize) -> Self {
        StaticMembership { peer_count }
    }
}

impl Membership for StaticMembership {
    fn start(&self, list: &mut dyn PeerList) -> Result<()> {
        list.update(ListUpdate {
            additions: PeerId::range(self.peer_count).collect(),
            removals: Vec::new(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::peer::BenchTransport;
    use crate::strategy::{BoundChooser, RequestMeta, RoundRobin};

    #[test]
    fn binds_every_peer() {
        let mut chooser = BoundChooser::new(
            Box::new(RoundRobin::new(BenchTransport::new())),
            Box::new(StaticMembership::new(3)),
        );
        chooser.start().expect("start");
        // Starting twice is a no-op, not a duplicate membership.
        chooser.start().expect("start");

        let request = RequestMeta { client_id: 0 };
        let chosen: Vec<_> = (0..3)
            .map(|_| chooser.choose(&request).expect("peer").peer())
            .collect();

        assert_eq!(chosen, PeerId::range(3).collect::<Vec<_>>());
    }
}
