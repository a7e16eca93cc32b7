//! Virtual server, a simulated RPC endpoint with configurable service latency.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use flume::{Receiver, Selector};
use tracing::{debug, trace};

use crate::fabric::Request;
use crate::latency::LatencyModel;
use crate::peer::PeerId;
use crate::signal::{Ack, Signal};

#[derive(Debug)]
pub struct VirtualServer {
    id: PeerId,
    group: String,
    latency: LatencyModel,
    received: AtomicU64,
}

/// A dequeued request waiting for its sampled latency to elapse.
#[derive(Debug)]
struct Scheduled {
    due: Instant,
    /// Arrival order, breaks ties between equal deadlines.
    arrival: u64,
    request: Request,
}

// Reversed, so that the earliest response sits on top of the max-heap.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.arrival).cmp(&(self.due, self.arrival))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.arrival) == (other.due, other.arrival)
    }
}

impl Eq for Scheduled {}

enum Event {
    Request(Request),
    Stop,
}

impl VirtualServer {
    pub fn new(id: PeerId, group: &str, latency: LatencyModel) -> Self {
        VirtualServer {
            id,
            group: group.to_string(),
            latency,
            received: AtomicU64::new(0),
        }
    }

    // === Getters ===

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn latency(&self) -> &LatencyModel {
        &self.latency
    }

    /// Requests dequeued so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    // === Worker ===

    /// Serve `inbox` between the `start` and `stop` broadcasts.
    ///
    /// Acknowledges `ready` once serving and `done` once stopped. The inbox is
    /// dropped before acknowledging `done`, so requests sent afterwards fail
    /// instead of blocking their sender.
    ///
    /// Every dequeued request is answered from this thread once its sampled
    /// latency elapsed. Responses still scheduled at stop are sent after `done`
    /// is acknowledged, before this returns.
    pub(crate) fn run(
        &self,
        inbox: Receiver<Request>,
        start: Signal,
        stop: Signal,
        ready: Ack,
        done: Ack,
    ) {
        start.wait();

        trace!(id = %self.id, group = %self.group, "Server serving");
        ready.ack();

        let mut scheduled = BinaryHeap::new();

        loop {
            self.respond_due(&mut scheduled, Instant::now());

            let selector = Selector::new()
                // A disconnected inbox means every sender is gone.
                .recv(&inbox, |request| request.map_or(Event::Stop, Event::Request))
                .recv(stop.receiver(), |_| Event::Stop);

            let event = match scheduled.peek() {
                Some(next) => selector.wait_deadline(next.due).ok(),
                None => Some(selector.wait()),
            };

            match event {
                Some(Event::Request(request)) => self.schedule(&mut scheduled, request),
                Some(Event::Stop) => break,
                // The earliest response is due.
                None => {}
            }

            if stop.is_fired() {
                break;
            }
        }

        drop(inbox);

        debug!(
            id = %self.id,
            received = self.received(),
            in_flight = scheduled.len(),
            "Server stopped"
        );
        done.ack();

        while let Some(next) = scheduled.pop() {
            if let Some(wait) = next.due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            next.request.respond(self.id);
        }
    }

    fn schedule(&self, scheduled: &mut BinaryHeap<Scheduled>, request: Request) {
        let arrival = self.received.fetch_add(1, Ordering::Relaxed);

        let latency = self.latency.sample();
        trace!(id = %self.id, client = request.client_id(), ?latency, "Serving request");

        scheduled.push(Scheduled {
            due: Instant::now() + latency,
            arrival,
            request,
        });
    }

    fn respond_due(&self, scheduled: &mut BinaryHeap<Scheduled>, now: Instant) {
        while scheduled.peek().map_or(false, |next| next.due <= now) {
            if let Some(next) = scheduled.pop() {
                next.request.respond(self.id);
            }
        }
    }
}
