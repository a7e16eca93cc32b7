//! Lock free counters, latency histograms and the snapshot handed to reporters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::peer::PeerId;

#[derive(Debug)]
/// Latency histogram over an immutable, strictly increasing table of bucket upper bounds.
///
/// A latency `L` is counted in bucket `i` iff `bound[i-1] < L <= bound[i]`,
/// latencies above the last bound are counted in the last bucket.
pub struct Histogram {
    bounds: Arc<[Duration]>,
    counts: Box<[AtomicU64]>,
}

impl Histogram {
    /// Create an empty histogram, `bounds` must be non empty and strictly increasing.
    pub fn new(bounds: Arc<[Duration]>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();

        Histogram { bounds, counts }
    }

    /// Convert a table of millisecond bounds.
    pub fn bounds_from_millis(millis: &[u64]) -> Arc<[Duration]> {
        millis.iter().copied().map(Duration::from_millis).collect()
    }

    /// Index of the bucket counting `latency`.
    pub fn bucket(&self, latency: Duration) -> usize {
        let index = self.bounds.partition_point(|bound| *bound < latency);

        index.min(self.bounds.len().saturating_sub(1))
    }

    pub fn record(&self, latency: Duration) {
        if let Some(count) = self.counts.get(self.bucket(latency)) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }

    /// `(upper bound in milliseconds, count)` for every bucket.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        self.bounds
            .iter()
            .zip(self.counts.iter())
            .map(|(bound, count)| (bound.as_millis() as u64, count.load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Debug)]
/// Counters of a single virtual client.
pub struct ClientMetrics {
    sent: Box<[AtomicU64]>,
    received: Box<[AtomicU64]>,
    failed: AtomicU64,
    latency: Histogram,
}

impl ClientMetrics {
    pub fn new(peer_count: usize, bounds: Arc<[Duration]>) -> Self {
        ClientMetrics {
            sent: counters(peer_count),
            received: counters(peer_count),
            failed: AtomicU64::new(0),
            latency: Histogram::new(bounds),
        }
    }

    /// A request is being handed over to `peer`'s queue.
    ///
    /// Counted before the handoff so that a server never received more than was
    /// sent to it, see [Self::cancel_sent].
    pub fn record_sent(&self, peer: PeerId) {
        if let Some(counter) = self.sent.get(peer.index()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The handoff recorded by [Self::record_sent] failed.
    pub fn cancel_sent(&self, peer: PeerId) {
        if let Some(counter) = self.sent.get(peer.index()) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// A response came back from `peer` after `latency`.
    pub fn record_response(&self, peer: PeerId, latency: Duration) {
        if let Some(counter) = self.received.get(peer.index()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.record(latency);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_total(&self) -> u64 {
        sum(&self.sent)
    }

    pub fn received_total(&self) -> u64 {
        sum(&self.received)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn latency(&self) -> &Histogram {
        &self.latency
    }

    pub(crate) fn sent(&self) -> Vec<u64> {
        load(&self.sent)
    }

    pub(crate) fn received(&self) -> Vec<u64> {
        load(&self.received)
    }
}

fn counters(n: usize) -> Box<[AtomicU64]> {
    (0..n).map(|_| AtomicU64::new(0)).collect()
}

fn load(counters: &[AtomicU64]) -> Vec<u64> {
    counters.iter().map(|c| c.load(Ordering::Relaxed)).collect()
}

fn sum(counters: &[AtomicU64]) -> u64 {
    counters.iter().map(|c| c.load(Ordering::Relaxed)).sum()
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Everything a reporter needs from a finished run.
pub struct RunReport {
    pub duration: Duration,
    pub servers: Vec<ServerReport>,
    pub clients: Vec<ClientReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerReport {
    pub id: PeerId,
    pub group: String,
    /// Requests dequeued by this server.
    pub received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientReport {
    pub id: usize,
    pub group: String,
    /// Requests handed to each server, indexed by [PeerId::index].
    pub sent: Vec<u64>,
    /// Responses recorded from each server, indexed by [PeerId::index].
    pub received: Vec<u64>,
    /// Requests that failed to be routed, delivered or answered.
    pub failed: u64,
    /// `(upper bound in milliseconds, count)` pairs.
    pub latency: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Sums over all clients of a group.
pub struct GroupTotals {
    pub sent: u64,
    pub received: u64,
    pub failed: u64,
}

impl ClientReport {
    pub fn sent_total(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn received_total(&self) -> u64 {
        self.received.iter().sum()
    }
}

impl RunReport {
    /// Names of server groups, in peer id order.
    pub fn server_groups(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for server in &self.servers {
            if !names.contains(&server.group.as_str()) {
                names.push(&server.group);
            }
        }
        names
    }

    /// Requests received by every server of a group.
    pub fn server_group_received(&self, group: &str) -> u64 {
        self.servers
            .iter()
            .filter(|server| server.group == group)
            .map(|server| server.received)
            .sum()
    }

    /// Requests sent by all clients to every server of a group.
    pub fn server_group_routed(&self, group: &str) -> u64 {
        self.servers
            .iter()
            .filter(|server| server.group == group)
            .map(|server| {
                self.clients
                    .iter()
                    .filter_map(|client| client.sent.get(server.id.index()))
                    .sum::<u64>()
            })
            .sum()
    }

    pub fn client_group_totals(&self, group: &str) -> GroupTotals {
        self.clients
            .iter()
            .filter(|client| client.group == group)
            .fold(GroupTotals::default(), |totals, client| GroupTotals {
                sent: totals.sent + client.sent_total(),
                received: totals.received + client.received_total(),
                failed: totals.failed + client.failed,
            })
    }

    /// Latency histogram summed over all clients of a group.
    pub fn client_group_latency(&self, group: &str) -> Vec<(u64, u64)> {
        let mut merged: Vec<(u64, u64)> = Vec::new();

        for client in self.clients.iter().filter(|client| client.group == group) {
            if merged.is_empty() {
                merged = client.latency.clone();
                continue;
            }
            for (bucket, (_, count)) in merged.iter_mut().zip(&client.latency) {
                bucket.1 += count;
            }
        }

        merged
    }
}
