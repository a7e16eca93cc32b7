//! Peer selection plug-ins.
//!
//! A selection algorithm implements [PeerList], a membership policy implements
//! [Membership]. A [BoundChooser] combines one of each for a single client.
//! Constructors for both are looked up by name in a [StrategyRegistry].

mod fewest_pending;
mod membership;
mod random;
pub mod registry;
mod round_robin;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::error::ChooseError;
use crate::peer::{BenchPeer, BenchTransport, PeerId};
use crate::{Error, Result};

pub use fewest_pending::FewestPending;
pub use membership::StaticMembership;
pub use random::RandomPeer;
pub use registry::StrategyRegistry;
pub use round_robin::RoundRobin;

pub const ROUND_ROBIN: &str = "round-robin";
pub const FEWEST_PENDING: &str = "fewest-pending";
pub const RANDOM: &str = "random";
pub const STATIC: &str = "static";

#[derive(Debug, Clone, Copy)]
/// What a chooser knows about the request it routes.
pub struct RequestMeta {
    pub client_id: usize,
}

#[derive(Debug, Clone, Default)]
/// Peers joining and leaving a [PeerList].
pub struct ListUpdate {
    pub additions: Vec<PeerId>,
    pub removals: Vec<PeerId>,
}

/// A peer selection algorithm.
pub trait PeerList: Debug + Send + Sync {
    /// Apply a membership change, only ever called before requests are routed.
    fn update(&mut self, update: ListUpdate) -> Result<()>;

    /// Pick the peer for the next request.
    ///
    /// The returned [Choice]'s completion must account for the request in
    /// whatever state the algorithm keeps, e.g. a pending count.
    fn choose(&self, request: &RequestMeta) -> std::result::Result<Choice, ChooseError>;
}

/// Source of the peers a [PeerList] chooses from.
pub trait Membership: Debug + Send + Sync {
    /// Populate `list`.
    fn start(&self, list: &mut dyn PeerList) -> Result<()>;
}

/// A chosen peer and the completion of the request routed to it.
pub struct Choice {
    peer: PeerId,
    completion: Completion,
}

impl Choice {
    pub fn new(peer: PeerId, completion: Completion) -> Self {
        Choice { peer, completion }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn into_parts(self) -> (PeerId, Completion) {
        (self.peer, self.completion)
    }
}

impl Debug for Choice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Choice").field("peer", &self.peer).finish()
    }
}

/// Completion callback of a routed request.
///
/// Runs exactly once, on [Completion::finish] or when dropped, whichever comes first.
pub struct Completion(Option<Box<dyn FnOnce() + Send>>);

impl Completion {
    pub fn new(on_finish: impl FnOnce() + Send + 'static) -> Self {
        Completion(Some(Box::new(on_finish)))
    }

    /// A completion with nothing to account for.
    pub fn noop() -> Self {
        Completion(None)
    }

    /// Ends the pending request on `peer`, after starting it.
    pub fn pending(peer: Arc<BenchPeer>) -> Self {
        peer.start_request();

        Completion::new(move || peer.end_request())
    }

    pub fn finish(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(on_finish) = self.0.take() {
            on_finish();
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.run();
    }
}

impl Debug for Completion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Completion")
            .field(&if self.0.is_some() { "pending" } else { "done" })
            .finish()
    }
}

#[derive(Debug)]
/// A [PeerList] bound to the [Membership] that populates it.
pub struct BoundChooser {
    list: Box<dyn PeerList>,
    membership: Box<dyn Membership>,
    started: bool,
}

impl BoundChooser {
    pub fn new(list: Box<dyn PeerList>, membership: Box<dyn Membership>) -> Self {
        BoundChooser {
            list,
            membership,
            started: false,
        }
    }

    /// Populate the list from its membership, O(peer count).
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.membership.start(self.list.as_mut())?;
        self.started = true;

        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn choose(&self, request: &RequestMeta) -> std::result::Result<Choice, ChooseError> {
        if !self.started {
            return Err(ChooseError::NotStarted);
        }

        self.list.choose(request)
    }
}

#[derive(Debug, Default)]
/// Ordered set of retained peers shared by the built-in algorithms.
pub(crate) struct PeerSet {
    transport: BenchTransport,
    peers: Vec<Arc<BenchPeer>>,
}

impl PeerSet {
    pub(crate) fn new(transport: BenchTransport) -> Self {
        PeerSet {
            transport,
            peers: Vec::new(),
        }
    }

    pub(crate) fn apply(&mut self, update: ListUpdate) -> Result<()> {
        for id in update.removals {
            if !self.transport.release_peer(id) {
                return Err(Error::Membership(format!("{} is not in the list", id)));
            }
            self.peers.retain(|peer| peer.id() != id);
        }

        for id in update.additions {
            if self.peers.iter().any(|peer| peer.id() == id) {
                return Err(Error::Membership(format!("{} is already in the list", id)));
            }
            self.peers.push(self.transport.retain_peer(id));
        }

        Ok(())
    }

    pub(crate) fn peers(&self) -> &[Arc<BenchPeer>] {
        &self.peers
    }
}
