//! Virtual client, issues paced requests through its own bound chooser.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use flume::{Selector, Sender};
use rand::distributions::Distribution;
use statrs::distribution::Normal;
use tracing::{debug, trace};

use crate::config::{ClientGroup, Config};
use crate::error::RequestError;
use crate::fabric::{Fabric, Request, Response};
use crate::metrics::ClientMetrics;
use crate::peer::PeerId;
use crate::signal::{Ack, Signal};
use crate::strategy::{BoundChooser, Completion, RequestMeta};

#[derive(Debug, Clone)]
/// Pause between two requests of a client.
pub struct Pacing {
    mean: Duration,
    jitter: Option<Normal>,
}

impl Pacing {
    /// Pacing for `rps` requests per second.
    ///
    /// Returns `None` if the rate is zero, or too small to ever issue a request.
    pub fn new(rps: f64, jitter: bool) -> Option<Self> {
        if rps.is_nan() || rps <= 0.0 {
            return None;
        }

        let mean = Duration::try_from_secs_f64(1.0 / rps)
            .ok()?
            .max(Duration::from_nanos(1));
        let jitter = if jitter {
            Normal::new(0.0, mean.as_secs_f64() / 20.0).ok()
        } else {
            None
        };

        Some(Pacing { mean, jitter })
    }

    pub fn mean(&self) -> Duration {
        self.mean
    }

    /// Draw the next pause, never negative.
    pub fn next_delay(&self) -> Duration {
        match &self.jitter {
            Some(noise) => {
                let delay = self.mean.as_secs_f64() + noise.sample(&mut rand::thread_rng());

                Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(self.mean)
            }
            None => self.mean,
        }
    }
}

#[derive(Debug)]
/// A request handed to a server and not answered yet.
struct InFlight {
    peer: PeerId,
    issued: Instant,
    completion: Completion,
}

#[derive(Debug, Default)]
/// Requests of one client awaiting their response, keyed by request id.
///
/// Dropping it fires the completion of every request still in flight.
struct Outstanding {
    requests: HashMap<u64, InFlight>,
    /// Timeout deadlines, in issue order. Entries of answered requests are skipped lazily.
    deadlines: VecDeque<(Instant, u64)>,
    next_id: u64,
}

impl Outstanding {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert(&mut self, request_id: u64, in_flight: InFlight, deadline: Option<Instant>) {
        if let Some(deadline) = deadline {
            self.deadlines.push_back((deadline, request_id));
        }
        self.requests.insert(request_id, in_flight);
    }

    fn remove(&mut self, request_id: u64) -> Option<InFlight> {
        self.requests.remove(&request_id)
    }

    /// Earliest deadline of a request still in flight.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&(deadline, request_id)) = self.deadlines.front() {
            if self.requests.contains_key(&request_id) {
                return Some(deadline);
            }
            self.deadlines.pop_front();
        }

        None
    }

    /// Remove every request whose deadline passed at `now`.
    fn expire(&mut self, now: Instant) -> Vec<InFlight> {
        let mut expired = Vec::new();

        while let Some(&(deadline, request_id)) = self.deadlines.front() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_front();

            if let Some(in_flight) = self.requests.remove(&request_id) {
                expired.push(in_flight);
            }
        }

        expired
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

enum Event {
    Response(Response),
    Stop,
}

#[derive(Debug)]
pub struct VirtualClient {
    id: usize,
    group: String,
    pacing: Option<Pacing>,
    chooser: BoundChooser,
    fabric: Arc<Fabric>,
    metrics: ClientMetrics,
    request_timeout: Option<Duration>,
    warmup: Duration,
}

impl VirtualClient {
    pub fn new(
        id: usize,
        group: &ClientGroup,
        chooser: BoundChooser,
        fabric: Arc<Fabric>,
        metrics: ClientMetrics,
        config: &Config,
    ) -> Self {
        VirtualClient {
            id,
            group: group.name.clone(),
            pacing: Pacing::new(group.rps, group.jitter),
            chooser,
            fabric,
            metrics,
            request_timeout: config.request_timeout,
            warmup: config.warmup,
        }
    }

    // === Getters ===

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns `None` for an idle client.
    pub fn pacing(&self) -> Option<&Pacing> {
        self.pacing.as_ref()
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    // === Worker ===

    /// Issue requests between the `start` and `stop` broadcasts, then acknowledge `done`.
    ///
    /// Every request of this client is driven from this thread: sends are paced,
    /// responses come back on one shared reply path and timeouts are tracked by
    /// deadline. Completions of requests still in flight at stop fire before
    /// `done` is acknowledged.
    pub(crate) fn run(&self, start: Signal, stop: Signal, done: Ack) {
        start.wait();

        let started = Instant::now();

        match &self.pacing {
            Some(pacing) => {
                trace!(client = self.id, group = %self.group, mean = ?pacing.mean(), "Client issuing");

                let (reply, replies) = flume::unbounded();
                let mut outstanding = Outstanding::default();
                let mut next_issue = started;

                while !stop.is_fired() {
                    let now = Instant::now();

                    if next_issue <= now {
                        if let Err(error) = self.issue(&mut outstanding, &reply) {
                            self.fail(error, &stop);
                        }
                        next_issue = now + pacing.next_delay();
                    }

                    self.expire(&mut outstanding, now, &stop);

                    let deadline = match outstanding.next_deadline() {
                        Some(timeout) => timeout.min(next_issue),
                        None => next_issue,
                    };

                    let event = Selector::new()
                        // The reply path never disconnects, `reply` is held right here.
                        .recv(&replies, |response| {
                            response.map_or(Event::Stop, Event::Response)
                        })
                        .recv(stop.receiver(), |_| Event::Stop)
                        .wait_deadline(deadline);

                    match event {
                        Ok(Event::Response(response)) => {
                            if let Err(error) =
                                self.complete(&mut outstanding, response, started, &stop)
                            {
                                self.fail(error, &stop);
                            }
                        }
                        Ok(Event::Stop) => break,
                        // Time to issue, or a request timed out.
                        Err(_) => {}
                    }
                }

                trace!(client = self.id, in_flight = outstanding.len(), "Abandoning requests");
            }
            None => stop.wait(),
        }

        debug!(
            client = self.id,
            sent = self.metrics.sent_total(),
            received = self.metrics.received_total(),
            "Client stopped"
        );
        done.ack();
    }

    /// Route one request and hand it to the chosen server.
    ///
    /// The chooser's completion is either stored with the in-flight request or
    /// dropped on failure, so it fires exactly once.
    fn issue(
        &self,
        outstanding: &mut Outstanding,
        reply: &Sender<Response>,
    ) -> Result<(), RequestError> {
        let request_meta = RequestMeta { client_id: self.id };
        let (peer, completion) = self.chooser.choose(&request_meta)?.into_parts();

        let request_id = outstanding.next_id();
        let request = Request::new(self.id, request_id, reply.clone());
        let issued = Instant::now();

        self.metrics.record_sent(peer);
        if self.fabric.listener(peer).send(request).is_err() {
            self.metrics.cancel_sent(peer);
            return Err(RequestError::ServerGone(peer));
        }

        let deadline = self.request_timeout.map(|timeout| issued + timeout);
        outstanding.insert(
            request_id,
            InFlight {
                peer,
                issued,
                completion,
            },
            deadline,
        );

        Ok(())
    }

    /// Match a response to its in-flight request, finish it and record it.
    fn complete(
        &self,
        outstanding: &mut Outstanding,
        response: Response,
        started: Instant,
        stop: &Signal,
    ) -> Result<(), RequestError> {
        let InFlight {
            peer,
            issued,
            completion,
        } = match outstanding.remove(response.request_id) {
            Some(in_flight) => in_flight,
            None => {
                trace!(client = self.id, request = response.request_id, "Dropping late response");
                return Ok(());
            }
        };

        let latency = issued.elapsed();
        completion.finish();

        if response.server_id != peer {
            return Err(RequestError::Misrouted {
                expected: peer,
                actual: response.server_id,
            });
        }

        if stop.is_fired() {
            trace!(client = self.id, %peer, "Dropping response received after stop");
            return Ok(());
        }
        if started.elapsed() < self.warmup {
            return Ok(());
        }

        self.metrics.record_response(peer, latency);
        trace!(client = self.id, %peer, ?latency, "Received response");

        Ok(())
    }

    /// Fail every request whose deadline passed.
    fn expire(&self, outstanding: &mut Outstanding, now: Instant, stop: &Signal) {
        for in_flight in outstanding.expire(now) {
            in_flight.completion.finish();
            self.fail(RequestError::Timeout(in_flight.peer), stop);
        }
    }

    fn fail(&self, error: RequestError, stop: &Signal) {
        // Sends racing the stop broadcast fail once servers are gone.
        if !stop.is_fired() {
            self.metrics.record_failure();
        }
        debug!(client = self.id, %error, "Request failed");
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::metrics::Histogram;
    use crate::peer::{BenchPeer, BenchTransport, PeerId};
    use crate::signal::{signal, CompletionBarrier};
    use crate::strategy::{FewestPending, PeerList, RoundRobin, StaticMembership, ROUND_ROBIN};

    fn client_with(
        list: Box<dyn PeerList>,
        rps: f64,
        peer_count: usize,
        config: &Config,
    ) -> (Arc<VirtualClient>, Vec<flume::Receiver<Request>>) {
        let (fabric, inboxes) = Fabric::new(peer_count);

        let mut chooser = BoundChooser::new(list, Box::new(StaticMembership::new(peer_count)));
        chooser.start().expect("start");

        let group = ClientGroup::new("test", 1, rps, ROUND_ROBIN);
        let metrics = ClientMetrics::new(peer_count, Histogram::bounds_from_millis(&[1, 10, 100]));

        let client = VirtualClient::new(0, &group, chooser, Arc::new(fabric), metrics, config);

        (Arc::new(client), inboxes)
    }

    fn client(
        rps: f64,
        peer_count: usize,
        config: &Config,
    ) -> (Arc<VirtualClient>, Vec<flume::Receiver<Request>>) {
        client_with(
            Box::new(RoundRobin::new(BenchTransport::new())),
            rps,
            peer_count,
            config,
        )
    }

    /// A fewest pending chooser whose peers are also handed back, to observe pending counts.
    fn fewest_pending(
        rps: f64,
        peer_count: usize,
        config: &Config,
    ) -> (
        Arc<VirtualClient>,
        Vec<flume::Receiver<Request>>,
        Vec<Arc<BenchPeer>>,
    ) {
        let mut transport = BenchTransport::new();
        let peers = PeerId::range(peer_count)
            .map(|id| transport.retain_peer(id))
            .collect();

        let (client, inboxes) =
            client_with(Box::new(FewestPending::new(transport)), rps, peer_count, config);

        (client, inboxes, peers)
    }

    fn pending(peers: &[Arc<BenchPeer>]) -> Vec<i64> {
        peers.iter().map(|peer| peer.pending()).collect()
    }

    /// Answer every request on `inbox` right away, as `id`.
    fn echo(inbox: flume::Receiver<Request>, id: PeerId) -> thread::JoinHandle<u64> {
        thread::spawn(move || {
            let mut served = 0;
            while let Ok(request) = inbox.recv() {
                served += 1;
                request.respond(id);
            }
            served
        })
    }

    /// Accept every request on `inbox` and never answer.
    fn hold(inbox: flume::Receiver<Request>) -> thread::JoinHandle<usize> {
        thread::spawn(move || inbox.iter().collect::<Vec<_>>().len())
    }

    /// Issue one request and complete it with the first response.
    fn round_trip(
        client: &VirtualClient,
        outstanding: &mut Outstanding,
        started: Instant,
        stop: &Signal,
    ) -> Result<(), RequestError> {
        let (reply, replies) = flume::unbounded();
        client.issue(outstanding, &reply)?;

        let response = replies
            .recv_timeout(Duration::from_secs(1))
            .expect("response");
        client.complete(outstanding, response, started, stop)
    }

    #[test]
    fn pacing() {
        assert!(Pacing::new(0.0, true).is_none());
        assert!(Pacing::new(f64::NAN, true).is_none());

        let pacing = Pacing::new(10.0, false).expect("pacing");
        assert_eq!(pacing.mean(), Duration::from_millis(100));
        assert_eq!(pacing.next_delay(), Duration::from_millis(100));

        let pacing = Pacing::new(10.0, true).expect("pacing");
        let total: Duration = (0..1000).map(|_| pacing.next_delay()).sum();
        let average = total / 1000;
        assert!(average > Duration::from_millis(95) && average < Duration::from_millis(105));

        // Never a zero pause.
        let pacing = Pacing::new(1e12, false).expect("pacing");
        assert_eq!(pacing.mean(), Duration::from_nanos(1));
    }

    #[test]
    fn issue_and_record() {
        let (client, mut inboxes) = client(100.0, 2, &Config::default());
        let (_stop_trigger, stop) = signal();
        let mut outstanding = Outstanding::default();

        let servers: Vec<_> = inboxes
            .drain(..)
            .enumerate()
            .map(|(i, inbox)| echo(inbox, PeerId::new(i)))
            .collect();

        for _ in 0..4 {
            round_trip(&client, &mut outstanding, Instant::now(), &stop).expect("request");
        }

        assert_eq!(outstanding.len(), 0);
        assert_eq!(client.metrics().sent(), vec![2, 2]);
        assert_eq!(client.metrics().received(), vec![2, 2]);
        assert_eq!(client.metrics().latency().total(), 4);
        assert_eq!(client.metrics().failed(), 0);

        drop(client);
        let served: u64 = servers
            .into_iter()
            .map(|server| server.join().expect("server thread"))
            .sum();
        assert_eq!(served, 4);
    }

    #[test]
    fn responses_match_their_request() {
        let (client, mut inboxes) = client(100.0, 2, &Config::default());
        let (_stop_trigger, stop) = signal();
        let mut outstanding = Outstanding::default();
        let (reply, replies) = flume::unbounded();

        let servers: Vec<_> = inboxes.drain(..).map(hold).collect();

        for _ in 0..4 {
            client.issue(&mut outstanding, &reply).expect("request");
        }
        assert_eq!(outstanding.len(), 4);

        // Answer request 2 only, it went to peer 0.
        client
            .complete(
                &mut outstanding,
                Response {
                    server_id: PeerId::new(0),
                    request_id: 2,
                },
                Instant::now(),
                &stop,
            )
            .expect("response");
        assert_eq!(outstanding.len(), 3);
        assert_eq!(client.metrics().received(), vec![1, 0]);

        // A second response for the same request is ignored.
        client
            .complete(
                &mut outstanding,
                Response {
                    server_id: PeerId::new(0),
                    request_id: 2,
                },
                Instant::now(),
                &stop,
            )
            .expect("late response");
        assert_eq!(client.metrics().received_total(), 1);
        assert!(replies.is_empty());

        drop(client);
        for server in servers {
            assert_eq!(server.join().expect("server thread"), 2);
        }
    }

    #[test]
    fn misrouted_response() {
        let (client, mut inboxes) = client(100.0, 1, &Config::default());
        let (_stop_trigger, stop) = signal();
        let mut outstanding = Outstanding::default();

        let server = echo(inboxes.remove(0), PeerId::new(5));

        assert!(matches!(
            round_trip(&client, &mut outstanding, Instant::now(), &stop),
            Err(RequestError::Misrouted { .. })
        ));
        assert_eq!(client.metrics().received_total(), 0);

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn server_gone() {
        let (client, inboxes) = client(100.0, 1, &Config::default());
        let mut outstanding = Outstanding::default();
        let (reply, _replies) = flume::unbounded();
        drop(inboxes);

        assert!(matches!(
            client.issue(&mut outstanding, &reply),
            Err(RequestError::ServerGone(_))
        ));
        assert_eq!(client.metrics().sent_total(), 0);
        assert_eq!(outstanding.len(), 0);
    }

    #[test]
    fn request_timeout() {
        let config = Config {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (client, mut inboxes) = client(100.0, 1, &config);
        let (_stop_trigger, stop) = signal();
        let mut outstanding = Outstanding::default();
        let (reply, _replies) = flume::unbounded();

        let server = hold(inboxes.remove(0));

        client.issue(&mut outstanding, &reply).expect("request");
        let deadline = outstanding.next_deadline().expect("deadline");

        client.expire(&mut outstanding, deadline - Duration::from_millis(1), &stop);
        assert_eq!(outstanding.len(), 1);
        assert_eq!(client.metrics().failed(), 0);

        client.expire(&mut outstanding, deadline, &stop);
        assert_eq!(outstanding.len(), 0);
        assert!(outstanding.next_deadline().is_none());
        assert_eq!(client.metrics().failed(), 1);

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn timeouts_while_running() {
        let config = Config {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (client, mut inboxes) = client(100.0, 1, &config);
        let server = hold(inboxes.remove(0));

        let (start_trigger, start) = signal();
        let (stop_trigger, stop) = signal();
        let mut done = CompletionBarrier::new();

        let handle = {
            let client = client.clone();
            let ack = done.participant();
            thread::spawn(move || client.run(start, stop, ack))
        };

        start_trigger.fire();
        thread::sleep(Duration::from_millis(200));
        stop_trigger.fire();
        done.wait().expect("client stopped");
        handle.join().expect("client thread");

        let failed = client.metrics().failed();
        assert!(failed > 5, "failed {failed}");
        assert!(failed <= client.metrics().sent_total());
        assert_eq!(client.metrics().received_total(), 0);

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn no_recording_after_stop_or_during_warmup() {
        let config = Config {
            warmup: Duration::from_secs(1),
            ..Default::default()
        };
        let (client, mut inboxes) = client(100.0, 1, &config);
        let server = echo(inboxes.remove(0), PeerId::new(0));
        let mut outstanding = Outstanding::default();

        let (_trigger, running) = signal();
        round_trip(&client, &mut outstanding, Instant::now(), &running).expect("request");
        assert_eq!(client.metrics().received_total(), 0);

        let (trigger, stopped) = signal();
        trigger.fire();
        let long_ago = Instant::now() - Duration::from_secs(2);
        round_trip(&client, &mut outstanding, long_ago, &stopped).expect("request");
        assert_eq!(client.metrics().received_total(), 0);

        round_trip(&client, &mut outstanding, long_ago, &running).expect("request");
        assert_eq!(client.metrics().received_total(), 1);
        assert_eq!(client.metrics().sent_total(), 3);

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn completions_fire_on_every_path() {
        let config = Config {
            request_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (_stop_trigger, running) = signal();
        let (trigger, stopped) = signal();
        trigger.fire();

        // Timeout.
        let (client, mut inboxes, peers) = fewest_pending(100.0, 2, &config);
        let servers: Vec<_> = inboxes.drain(..).map(hold).collect();
        let mut outstanding = Outstanding::default();
        let (reply, _replies) = flume::unbounded();

        client.issue(&mut outstanding, &reply).expect("request");
        client.issue(&mut outstanding, &reply).expect("request");
        assert_eq!(pending(&peers), vec![1, 1]);

        client.expire(&mut outstanding, Instant::now() + Duration::from_secs(1), &running);
        assert_eq!(pending(&peers), vec![0, 0]);
        assert_eq!(client.metrics().failed(), 2);

        // Abandoned at stop.
        client.issue(&mut outstanding, &reply).expect("request");
        assert_eq!(pending(&peers).iter().sum::<i64>(), 1);
        drop(outstanding);
        assert_eq!(pending(&peers), vec![0, 0]);

        drop(client);
        for server in servers {
            server.join().expect("server thread");
        }

        // Server gone.
        let (client, inboxes, peers) = fewest_pending(100.0, 2, &config);
        drop(inboxes);
        let mut outstanding = Outstanding::default();

        assert!(matches!(
            client.issue(&mut outstanding, &reply),
            Err(RequestError::ServerGone(_))
        ));
        assert_eq!(pending(&peers), vec![0, 0]);

        // Answered after stop, then misrouted.
        let (client, mut inboxes, peers) = fewest_pending(100.0, 2, &config);
        let honest = echo(inboxes.remove(0), PeerId::new(0));
        let misrouting = echo(inboxes.remove(0), PeerId::new(9));
        let mut outstanding = Outstanding::default();

        round_trip(&client, &mut outstanding, Instant::now(), &stopped).expect("response");
        assert_eq!(pending(&peers), vec![0, 0]);
        assert_eq!(client.metrics().received_total(), 0);

        assert!(matches!(
            round_trip(&client, &mut outstanding, Instant::now(), &running),
            Err(RequestError::Misrouted { .. })
        ));
        assert_eq!(pending(&peers), vec![0, 0]);

        drop(client);
        honest.join().expect("server thread");
        misrouting.join().expect("server thread");
    }

    #[test]
    fn no_pending_left_after_run() {
        let (client, mut inboxes, peers) = fewest_pending(500.0, 3, &Config::default());

        // One fast peer, one slow, one that never answers.
        let fast = echo(inboxes.remove(0), PeerId::new(0));
        let slow_inbox = inboxes.remove(0);
        let slow = thread::spawn(move || {
            while let Ok(request) = slow_inbox.recv() {
                thread::sleep(Duration::from_millis(5));
                request.respond(PeerId::new(1));
            }
        });
        let silent = hold(inboxes.remove(0));

        let (start_trigger, start) = signal();
        let (stop_trigger, stop) = signal();
        let mut done = CompletionBarrier::new();

        let handle = {
            let client = client.clone();
            let ack = done.participant();
            thread::spawn(move || client.run(start, stop, ack))
        };

        start_trigger.fire();
        thread::sleep(Duration::from_millis(200));
        assert!(peers[2].pending() > 0);

        stop_trigger.fire();
        done.wait().expect("client stopped");
        handle.join().expect("client thread");

        assert_eq!(pending(&peers), vec![0, 0, 0]);
        assert!(client.metrics().received_total() > 0);

        drop(client);
        fast.join().expect("fast server");
        slow.join().expect("slow server");
        silent.join().expect("silent server");
    }

    #[test]
    fn run_until_stopped() {
        let (client, mut inboxes) = client(200.0, 1, &Config::default());
        let server = echo(inboxes.remove(0), PeerId::new(0));

        let (start_trigger, start) = signal();
        let (stop_trigger, stop) = signal();
        let mut done = CompletionBarrier::new();

        let handle = {
            let client = client.clone();
            let ack = done.participant();
            thread::spawn(move || client.run(start, stop, ack))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(client.metrics().sent_total(), 0);

        start_trigger.fire();
        thread::sleep(Duration::from_millis(200));
        stop_trigger.fire();
        done.wait().expect("client stopped");
        handle.join().expect("client thread");

        // Nothing is recorded once the client stopped.
        let received = client.metrics().received_total();
        let sent = client.metrics().sent_total();
        assert!(received > 0);
        assert!(received <= sent);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(client.metrics().received_total(), received);
        assert_eq!(client.metrics().sent_total(), sent);

        drop(client);
        server.join().expect("server thread");
    }

    #[test]
    fn idle_client() {
        let (client, _inboxes) = client(0.0, 1, &Config::default());
        assert!(client.pacing().is_none());

        let (start_trigger, start) = signal();
        let (stop_trigger, stop) = signal();
        let mut done = CompletionBarrier::new();
        let ack = done.participant();

        start_trigger.fire();
        stop_trigger.fire();
        client.run(start, stop, ack);

        done.wait().expect("client stopped");
        assert_eq!(client.metrics().sent_total(), 0);
        assert_eq!(client.metrics().failed(), 0);
    }
}
