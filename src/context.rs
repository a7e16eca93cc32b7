//! Topology construction and the three phase benchmark lifecycle.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::Receiver;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::client::VirtualClient;
use crate::config::{ClientGroup, Config};
use crate::fabric::{Fabric, Request};
use crate::latency::LatencyModel;
use crate::metrics::{ClientMetrics, ClientReport, Histogram, RunReport, ServerReport};
use crate::peer::PeerId;
use crate::server::VirtualServer;
use crate::signal::{signal, CompletionBarrier};
use crate::strategy::{BoundChooser, StrategyRegistry};
use crate::{Error, Result};

#[derive(Debug)]
/// A fully built benchmark: servers, clients and the fabric connecting them.
///
/// Nothing runs until [BenchmarkContext::run] is called.
pub struct BenchmarkContext {
    duration: Duration,
    servers: Vec<Arc<VirtualServer>>,
    clients: Vec<Arc<VirtualClient>>,
    /// Taken by the single run.
    inboxes: Option<Vec<Receiver<Request>>>,
}

impl BenchmarkContext {
    /// Validate `config` and build every server and client, starting each
    /// client's chooser.
    ///
    /// All construction errors are collected and returned combined, before any
    /// thread is spawned.
    pub fn build(config: &Config, registry: &StrategyRegistry) -> Result<Self> {
        config.validate()?;

        let server_count = config.server_count();
        let client_count = config.client_count();

        let (fabric, inboxes) = Fabric::new(server_count);
        let fabric = Arc::new(fabric);

        let mut errors = Vec::new();

        let mut servers = Vec::with_capacity(server_count);
        for group in &config.server_groups {
            let latency = match LatencyModel::new(&group.latency, group.pin) {
                Ok(latency) => latency,
                Err(error) => {
                    errors.push(error);
                    continue;
                }
            };

            for _ in 0..group.count {
                let id = PeerId::new(servers.len());
                servers.push(Arc::new(VirtualServer::new(id, &group.name, latency.clone())));
            }
        }

        let mut choosers: Vec<(&ClientGroup, BoundChooser)> = Vec::with_capacity(client_count);
        for group in &config.client_groups {
            let unknown = registry.check(group);
            if !unknown.is_empty() {
                errors.extend(unknown);
                continue;
            }

            for _ in 0..group.count {
                match registry.bound_chooser(group, server_count) {
                    Ok(chooser) => choosers.push((group, chooser)),
                    Err(error) => {
                        errors.push(error);
                        break;
                    }
                }
            }
        }

        if let Some(error) = Error::combine(errors) {
            return Err(error);
        }

        let started = Instant::now();

        let errors: Vec<Error> = choosers
            .par_iter_mut()
            .filter_map(|(_, chooser)| chooser.start().err())
            .collect();

        info!(
            clients = client_count,
            servers = server_count,
            elapsed = ?started.elapsed(),
            "Started choosers"
        );

        if let Some(error) = Error::combine(errors) {
            return Err(error);
        }

        let bounds = Histogram::bounds_from_millis(&config.latency_buckets_ms);

        let clients = choosers
            .into_iter()
            .enumerate()
            .map(|(id, (group, chooser))| {
                let metrics = ClientMetrics::new(server_count, bounds.clone());

                Arc::new(VirtualClient::new(
                    id,
                    group,
                    chooser,
                    fabric.clone(),
                    metrics,
                    config,
                ))
            })
            .collect();

        Ok(BenchmarkContext {
            duration: config.duration,
            servers,
            clients,
            inboxes: Some(inboxes),
        })
    }

    // === Getters ===

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn servers(&self) -> &[Arc<VirtualServer>] {
        &self.servers
    }

    pub fn clients(&self) -> &[Arc<VirtualClient>] {
        &self.clients
    }

    /// Largest median latency of any server.
    pub fn max_latency(&self) -> Duration {
        self.servers
            .iter()
            .map(|server| server.latency().median())
            .max()
            .unwrap_or_default()
    }

    // === Public Methods ===

    /// Drive the benchmark, blocking for its whole duration.
    ///
    /// 1. Start every server and wait until all of them are serving.
    /// 2. Start every client, issuing requests for the configured duration.
    /// 3. Broadcast stop and wait until every server and client stopped.
    ///
    /// Clients abandon their requests still in flight at stop. Servers keep
    /// answering those in the background, until their last sampled latency
    /// elapsed; the responses are not recorded.
    ///
    /// Can only be called once.
    pub fn run(&mut self) -> Result<()> {
        let inboxes = self.inboxes.take().ok_or(Error::AlreadyLaunched)?;

        // Dropping a trigger fires it, so every early return below unwinds
        // the workers spawned so far.
        let (server_start, server_started) = signal();
        let (client_start, client_started) = signal();
        let (stop, stopped) = signal();

        let mut ready = CompletionBarrier::new();
        let mut done = CompletionBarrier::new();

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.clients.len());

        info!(servers = self.servers.len(), "Launching servers");

        for (server, inbox) in self.servers.iter().zip(inboxes) {
            let server = server.clone();
            let start = server_started.clone();
            let stop = stopped.clone();
            let (ready, done) = (ready.participant(), done.participant());

            // Detached, a server outlives `done` by its scheduled responses.
            thread::Builder::new()
                .name(format!("server-{}", server.id().index()))
                .spawn(move || server.run(inbox, start, stop, ready, done))?;
        }

        server_start.fire();
        ready.wait()?;

        info!(
            clients = self.clients.len(),
            duration = ?self.duration,
            "Servers ready, launching clients"
        );

        for client in &self.clients {
            let client = client.clone();
            let start = client_started.clone();
            let stop = stopped.clone();
            let done = done.participant();

            handles.push(
                thread::Builder::new()
                    .name(format!("client-{}", client.id()))
                    .spawn(move || client.run(start, stop, done))?,
            );
        }

        let started = Instant::now();
        client_start.fire();

        thread::sleep(self.duration);

        info!(elapsed = ?started.elapsed(), "Stopping benchmark");
        stop.fire();
        done.wait()?;

        for handle in handles {
            if handle.join().is_err() {
                warn!("A benchmark client panicked");
            }
        }

        debug!("Benchmark stopped");

        Ok(())
    }

    /// Snapshot of every counter and histogram.
    pub fn report(&self) -> RunReport {
        RunReport {
            duration: self.duration,
            servers: self
                .servers
                .iter()
                .map(|server| ServerReport {
                    id: server.id(),
                    group: server.group().to_string(),
                    received: server.received(),
                })
                .collect(),
            clients: self
                .clients
                .iter()
                .map(|client| {
                    let metrics = client.metrics();

                    ClientReport {
                        id: client.id(),
                        group: client.group().to_string(),
                        sent: metrics.sent(),
                        received: metrics.received(),
                        failed: metrics.failed(),
                        latency: metrics.latency().snapshot(),
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{LatencyProfile, ServerGroup};
    use crate::strategy::{FEWEST_PENDING, ROUND_ROBIN};

    fn config() -> Config {
        Config {
            server_groups: vec![
                ServerGroup::log_normal("fast", 2, Duration::from_millis(5)),
                ServerGroup::log_normal("slow", 1, Duration::from_millis(50)),
            ],
            client_groups: vec![
                ClientGroup::new("rr", 2, 50.0, ROUND_ROBIN),
                ClientGroup::new("fp", 1, 50.0, FEWEST_PENDING),
            ],
            duration: Duration::from_millis(300),
            ..Default::default()
        }
    }

    #[test]
    fn build() {
        let context =
            BenchmarkContext::build(&config(), &StrategyRegistry::default()).expect("valid config");

        assert_eq!(context.server_count(), 3);
        assert_eq!(context.client_count(), 3);
        assert_eq!(context.max_latency(), Duration::from_millis(50));

        let ids: Vec<_> = context.servers().iter().map(|s| s.id()).collect();
        assert_eq!(ids, PeerId::range(3).collect::<Vec<_>>());

        let groups: Vec<_> = context.clients().iter().map(|c| c.group()).collect();
        assert_eq!(groups, vec!["rr", "rr", "fp"]);
    }

    #[test]
    fn invalid_config_fails_before_build() {
        let mut config = config();
        config.duration = Duration::ZERO;

        assert!(matches!(
            BenchmarkContext::build(&config, &StrategyRegistry::default()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_names_are_combined() {
        let mut config = config();
        config.client_groups[0].strategy = "least-loaded".into();
        config.client_groups[1].membership = "subsetting".into();

        match BenchmarkContext::build(&config, &StrategyRegistry::default()) {
            Err(Error::Multiple(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(matches!(errors[0], Error::UnknownStrategy(_)));
                assert!(matches!(errors[1], Error::UnknownMembership(_)));
            }
            other => panic!("expected combined errors, got {:?}", other),
        }
    }

    #[test]
    fn failing_membership() {
        let mut registry = StrategyRegistry::default();
        registry
            .register_membership("broken", |_| {
                Err(Error::Membership("no peers today".into()))
            })
            .expect("register");

        let mut config = config();
        config.client_groups[0].membership = "broken".into();

        assert!(matches!(
            BenchmarkContext::build(&config, &registry),
            Err(Error::Membership(_))
        ));
    }

    #[test]
    fn run_once() {
        let mut config = config();
        config.server_groups[1].latency = LatencyProfile::for_rps(100);

        let mut context =
            BenchmarkContext::build(&config, &StrategyRegistry::default()).expect("valid config");

        context.run().expect("run");
        assert!(matches!(context.run(), Err(Error::AlreadyLaunched)));

        let report = context.report();
        assert_eq!(report.servers.len(), 3);
        assert_eq!(report.clients.len(), 3);
        assert!(report.clients.iter().all(|c| c.sent_total() > 0));
        assert!(report
            .clients
            .iter()
            .all(|c| c.received_total() <= c.sent_total()));
    }
}
