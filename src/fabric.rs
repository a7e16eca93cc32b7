//! In-process request fabric, one rendezvous queue per virtual server.

use flume::{Receiver, Sender};

use crate::peer::PeerId;

#[derive(Debug)]
/// A request envelope, carries its own reply path.
///
/// The reply path may be shared by every request of a client, `request_id`
/// tells their responses apart.
pub struct Request {
    client_id: usize,
    request_id: u64,
    reply: Sender<Response>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A response envelope.
pub struct Response {
    pub server_id: PeerId,
    /// Echo of [Request::request_id].
    pub request_id: u64,
}

impl Request {
    pub fn new(client_id: usize, request_id: u64, reply: Sender<Response>) -> Self {
        Request {
            client_id,
            request_id,
            reply,
        }
    }

    /// Create a request and the receiving end of its own one-shot reply path.
    pub fn one_shot(client_id: usize) -> (Self, Receiver<Response>) {
        let (reply, receiver) = flume::bounded(1);

        (Request::new(client_id, 0, reply), receiver)
    }

    pub fn client_id(&self) -> usize {
        self.client_id
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Reply to the requester.
    ///
    /// The requester may have given up already, in which case the response is dropped.
    pub fn respond(self, server_id: PeerId) {
        let _ = self.reply.send(Response {
            server_id,
            request_id: self.request_id,
        });
    }
}

#[derive(Debug, Clone)]
/// Write ends of every server's queue, shared by all clients.
pub struct Fabric {
    listeners: Box<[Sender<Request>]>,
}

impl Fabric {
    /// Allocate `server_count` queues.
    ///
    /// Returns the fabric and, in peer id order, the read end each server owns.
    ///
    /// Queues are rendezvous channels, a send completes once the server dequeued it,
    /// and fails as soon as the server dropped its read end.
    pub fn new(server_count: usize) -> (Self, Vec<Receiver<Request>>) {
        let (listeners, inboxes): (Vec<_>, Vec<_>) =
            (0..server_count).map(|_| flume::bounded(0)).unzip();

        (
            Fabric {
                listeners: listeners.into(),
            },
            inboxes,
        )
    }

    /// Queue of the server with the given id.
    ///
    /// # Panics
    ///
    /// Peer ids are generated internally, an id outside of the fabric is a bug.
    pub fn listener(&self, id: PeerId) -> &Sender<Request> {
        match self.listeners.get(id.index()) {
            Some(listener) => listener,
            None => panic!(
                "peer id out of range, id: {}, fabric size: {}",
                id.index(),
                self.listeners.len()
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}
