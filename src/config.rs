//! Benchmark configuration

use std::collections::HashSet;
use std::time::Duration;

use crate::strategy::{FEWEST_PENDING, ROUND_ROBIN, STATIC};
use crate::{Error, Result};

/// Default upper bounds of latency histogram buckets, in milliseconds.
pub const DEFAULT_LATENCY_BUCKETS_MS: [u64; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 14, 16, 18, 20, 25, 30, 35, 40, 45, 50, 60, 70, 80, 90,
    100, 120, 140, 160, 180, 200, 250, 300, 350, 400, 450, 500, 600, 700, 800, 900, 1000, 1200,
    1400, 1600, 1800, 2000, 2500, 3000, 3500, 4000, 4500, 5000, 6000, 7000, 8000, 9000, 10000,
    12500, 15000, 20000, 30000, 60000, 100000,
];

/// Highest rate a client can be paced at, one request per nanosecond.
pub const MAX_RPS: f64 = 1e9;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
/// Benchmark Configurations
pub struct Config {
    /// Populations of virtual servers, ids are assigned densely in group order.
    pub server_groups: Vec<ServerGroup>,
    /// Populations of virtual clients.
    pub client_groups: Vec<ClientGroup>,
    /// How long clients issue requests once every server is ready.
    ///
    /// Defaults to 10 seconds.
    pub duration: Duration,
    /// Responses completing within this window after clients start are neither
    /// counted nor recorded in latency histograms.
    ///
    /// Defaults to zero, recording everything.
    pub warmup: Duration,
    /// Optional deadline for a single request.
    ///
    /// Defaults to None, a request waits for its response until the server stops.
    pub request_timeout: Option<Duration>,
    /// Upper bounds of latency histogram buckets in milliseconds, strictly increasing.
    ///
    /// Defaults to [DEFAULT_LATENCY_BUCKETS_MS]
    pub latency_buckets_ms: Vec<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_groups: Vec::new(),
            client_groups: Vec::new(),
            duration: Duration::from_secs(10),
            warmup: Duration::ZERO,
            request_timeout: None,
            latency_buckets_ms: DEFAULT_LATENCY_BUCKETS_MS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A named population of identical virtual servers.
pub struct ServerGroup {
    pub name: String,
    pub count: usize,
    pub latency: LatencyProfile,
    /// Deterministic latency, every request takes exactly the profile's median.
    #[cfg_attr(feature = "serde", serde(default))]
    pub pin: bool,
}

impl ServerGroup {
    /// Server group with log normal latency around `median`.
    pub fn log_normal(name: &str, count: usize, median: Duration) -> Self {
        ServerGroup {
            name: name.to_string(),
            count,
            latency: LatencyProfile::LogNormal { median },
            pin: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// A named population of identical virtual clients.
pub struct ClientGroup {
    pub name: String,
    pub count: usize,
    /// Requests per second issued by each client, `0` keeps clients idle.
    pub rps: f64,
    /// Name of the selection strategy in the [crate::StrategyRegistry].
    pub strategy: String,
    /// Name of the membership policy in the [crate::StrategyRegistry].
    ///
    /// Defaults to [STATIC]
    #[cfg_attr(feature = "serde", serde(default = "default_membership"))]
    pub membership: String,
    /// Add normally distributed noise to the pause between requests, so that
    /// clients don't issue in synchronized bursts.
    ///
    /// Defaults to true.
    #[cfg_attr(feature = "serde", serde(default = "default_jitter"))]
    pub jitter: bool,
}

impl ClientGroup {
    pub fn new(name: &str, count: usize, rps: f64, strategy: &str) -> Self {
        ClientGroup {
            name: name.to_string(),
            count,
            rps,
            strategy: strategy.to_string(),
            membership: default_membership(),
            jitter: default_jitter(),
        }
    }
}

fn default_membership() -> String {
    STATIC.to_string()
}

fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
/// Shape of a server group's simulated latency.
pub enum LatencyProfile {
    /// See [crate::latency::LogNormalLatency]
    LogNormal { median: Duration },
    /// See [crate::latency::PercentileLatency]
    Percentiles {
        p50: Duration,
        p90: Duration,
        p99: Duration,
        p100: Duration,
    },
}

impl LatencyProfile {
    /// Percentiles proportional to the pause between requests at `rps`.
    pub fn for_rps(rps: u32) -> Self {
        let normal = Duration::from_secs(1) / rps.max(1);

        LatencyProfile::Percentiles {
            p50: normal * 4 / 10,
            p90: normal * 7 / 10,
            p99: normal * 8 / 10,
            p100: normal * 2,
        }
    }

    pub fn median(&self) -> Duration {
        match self {
            LatencyProfile::LogNormal { median } => *median,
            LatencyProfile::Percentiles { p50, .. } => *p50,
        }
    }
}

impl Config {
    /// Total number of virtual servers.
    pub fn server_count(&self) -> usize {
        self.server_groups.iter().map(|group| group.count).sum()
    }

    /// Total number of virtual clients.
    pub fn client_count(&self) -> usize {
        self.client_groups.iter().map(|group| group.count).sum()
    }

    /// Check the configuration before any part of the topology is built.
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.duration.is_zero() {
            return Err(invalid(format!(
                "test duration must be greater than 0, current: {:?}",
                self.duration
            )));
        }

        if self.warmup >= self.duration {
            return Err(invalid(format!(
                "warmup must be shorter than test duration, warmup: {:?}, duration: {:?}",
                self.warmup, self.duration
            )));
        }

        if let Some(timeout) = self.request_timeout {
            if timeout.is_zero() {
                return Err(invalid("request timeout must be greater than 0".into()));
            }
        }

        if self.latency_buckets_ms.is_empty() {
            return Err(invalid("latency buckets must not be empty".into()));
        }

        if self.latency_buckets_ms.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(
                "latency buckets must be strictly increasing".into(),
            ));
        }

        self.check_server_groups()?;
        self.check_client_groups()
    }

    fn check_server_groups(&self) -> Result<()> {
        let mut names = HashSet::new();

        for group in &self.server_groups {
            if group.name.is_empty() {
                return Err(invalid("server group name is empty".into()));
            }
            if !names.insert(group.name.as_str()) {
                return Err(invalid(format!(
                    "server group name duplicated, name: {:?}",
                    group.name
                )));
            }
            if group.count == 0 {
                return Err(invalid(format!(
                    "number of servers must be greater than 0, server group: {:?}",
                    group.name
                )));
            }
            if let LatencyProfile::Percentiles {
                p50,
                p90,
                p99,
                p100,
            } = group.latency
            {
                if p90 < p50 || p99 < p90 || p100 < p99 {
                    return Err(Error::LatencyOrder {
                        p50,
                        p90,
                        p99,
                        p100,
                    });
                }
            }
        }

        Ok(())
    }

    fn check_client_groups(&self) -> Result<()> {
        let mut names = HashSet::new();

        for group in &self.client_groups {
            if group.name.is_empty() {
                return Err(invalid("client group name is empty".into()));
            }
            if !names.insert(group.name.as_str()) {
                return Err(invalid(format!(
                    "client group name duplicated, name: {:?}",
                    group.name
                )));
            }
            if !group.rps.is_finite() || group.rps < 0.0 {
                return Err(invalid(format!(
                    "rps must be a finite number not smaller than 0, rps: {}",
                    group.rps
                )));
            }
            if group.rps > MAX_RPS {
                return Err(invalid(format!(
                    "rps must not exceed {}, rps: {}",
                    MAX_RPS, group.rps
                )));
            }
            if group.count == 0 {
                return Err(invalid(format!(
                    "number of clients must be greater than 0, client group: {:?}",
                    group.name
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> Error {
    Error::InvalidConfig(message)
}

/// Ready made scenarios comparing round robin with fewest pending.
pub mod presets {
    use super::*;

    /// Identical servers, both strategies should spread load evenly.
    pub fn round_robin_works() -> Config {
        Config {
            client_groups: both_strategies(500, 20.0),
            server_groups: vec![ServerGroup::log_normal(
                "normal",
                50,
                Duration::from_millis(100),
            )],
            ..Default::default()
        }
    }

    /// Half the servers are ten times slower, fewest pending routes around them.
    pub fn fewest_pending_superior() -> Config {
        Config {
            client_groups: both_strategies(1000, 20.0),
            server_groups: vec![
                ServerGroup::log_normal("normal", 5, Duration::from_millis(100)),
                ServerGroup::log_normal("slow", 5, Duration::from_secs(1)),
            ],
            ..Default::default()
        }
    }

    /// Many more servers than pending requests per client, fewest pending loses its edge.
    pub fn fewest_pending_degradation() -> Config {
        Config {
            client_groups: both_strategies(1000, 20.0),
            server_groups: vec![
                ServerGroup::log_normal("normal", 50, Duration::from_millis(100)),
                ServerGroup::log_normal("slow", 50, Duration::from_secs(1)),
            ],
            ..Default::default()
        }
    }

    fn both_strategies(count: usize, rps: f64) -> Vec<ClientGroup> {
        vec![
            ClientGroup::new(ROUND_ROBIN, count, rps, ROUND_ROBIN),
            ClientGroup::new(FEWEST_PENDING, count, rps, FEWEST_PENDING),
        ]
    }
}
