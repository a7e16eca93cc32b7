//! Simulated service time of virtual servers.

use std::time::Duration;

use rand::distributions::Distribution;
use rand::Rng;
use statrs::distribution::Normal;
use statrs::function::erf::erf;

use crate::config::LatencyProfile;
use crate::{Error, Result};

/// Standard deviation of `ln(latency)`.
///
/// Keeps samples of a log normal model within a realistic `[median / 10, median * 10]`
/// for all practical purposes.
pub const LOG_NORMAL_SIGMA: f64 = 0.5;

#[derive(Debug, Clone)]
/// Sampler of server side latency.
pub enum LatencyModel {
    LogNormal(LogNormalLatency),
    Percentile(PercentileLatency),
    /// Deterministic latency, every sample is the same.
    Pinned(Duration),
}

impl LatencyModel {
    /// Build a model from a configured profile.
    ///
    /// With `pin` set, the model always returns the profile's median.
    pub fn new(profile: &LatencyProfile, pin: bool) -> Result<Self> {
        let model = match *profile {
            LatencyProfile::LogNormal { median } => {
                LatencyModel::LogNormal(LogNormalLatency::new(median)?)
            }
            LatencyProfile::Percentiles {
                p50,
                p90,
                p99,
                p100,
            } => LatencyModel::Percentile(PercentileLatency::new(p50, p90, p99, p100)?),
        };

        if pin {
            return Ok(LatencyModel::Pinned(model.median()));
        }

        Ok(model)
    }

    /// Draw one service duration.
    pub fn sample(&self) -> Duration {
        match self {
            LatencyModel::LogNormal(model) => model.sample(),
            LatencyModel::Percentile(model) => model.sample(),
            LatencyModel::Pinned(latency) => *latency,
        }
    }

    pub fn median(&self) -> Duration {
        match self {
            LatencyModel::LogNormal(model) => model.median(),
            LatencyModel::Percentile(model) => model.p50,
            LatencyModel::Pinned(latency) => *latency,
        }
    }
}

#[derive(Debug, Clone)]
/// Log normal latency, a variable whose logarithm is normally distributed.
///
/// See <https://en.wikipedia.org/wiki/Log-normal_distribution>
pub struct LogNormalLatency {
    mu: f64,
    sigma: f64,
    median: Duration,
    standard: Normal,
}

impl LogNormalLatency {
    /// Create a log normal sampler centered on `median`.
    pub fn new(median: Duration) -> Result<Self> {
        if median.is_zero() {
            return Err(Error::InvalidConfig(
                "log normal median must be greater than 0".into(),
            ));
        }

        let standard = Normal::new(0.0, 1.0).map_err(|e| Error::InvalidConfig(e.to_string()))?;

        Ok(LogNormalLatency {
            mu: (median.as_nanos() as f64).ln(),
            sigma: LOG_NORMAL_SIGMA,
            median,
            standard,
        })
    }

    pub fn median(&self) -> Duration {
        self.median
    }

    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let z = self.standard.sample(rng);

        nanos((z * self.sigma + self.mu).exp())
    }

    /// Probability that a sample is smaller than or equal to `x`.
    pub fn cdf(&self, x: Duration) -> f64 {
        let x = x.as_nanos() as f64;

        0.5 + 0.5 * erf((x.ln() - self.mu) / (std::f64::consts::SQRT_2 * self.sigma))
    }

    /// Latency below which a fraction `p` of samples fall, found by binary search over [Self::cdf].
    pub fn quantile(&self, p: f64) -> Duration {
        let p = p.clamp(0.0, 1.0);

        let mut low = 0_u64;
        // 10 sigmas above the median, far beyond anything sampled.
        let mut high = nanos((self.mu + 10.0 * self.sigma).exp()).as_nanos() as u64;

        while low < high {
            let middle = low + (high - low) / 2;

            if self.cdf(Duration::from_nanos(middle)) < p {
                low = middle + 1;
            } else {
                high = middle;
            }
        }

        Duration::from_nanos(low)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Latency interpolated linearly between four configured percentiles.
pub struct PercentileLatency {
    p50: Duration,
    p90: Duration,
    p99: Duration,
    p100: Duration,
}

impl PercentileLatency {
    /// Fails unless `p50 <= p90 <= p99 <= p100`.
    pub fn new(p50: Duration, p90: Duration, p99: Duration, p100: Duration) -> Result<Self> {
        if p90 < p50 || p99 < p90 || p100 < p99 {
            return Err(Error::LatencyOrder {
                p50,
                p90,
                p99,
                p100,
            });
        }

        Ok(PercentileLatency {
            p50,
            p90,
            p99,
            p100,
        })
    }

    pub fn sample(&self) -> Duration {
        self.sample_with(&mut rand::thread_rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        self.at_percentile(rng.gen_range(0.0..=100.0))
    }

    /// Deterministic mapping from a percentile `r` in `[0, 100]` to a latency.
    pub fn at_percentile(&self, r: f64) -> Duration {
        let r = r.clamp(0.0, 100.0);

        if r <= 50.0 {
            interpolate(Duration::ZERO, self.p50, r / 50.0)
        } else if r <= 90.0 {
            interpolate(self.p50, self.p90, (r - 50.0) / 40.0)
        } else if r <= 99.0 {
            interpolate(self.p90, self.p99, (r - 90.0) / 9.0)
        } else {
            self.p100
        }
    }
}

fn interpolate(from: Duration, to: Duration, fraction: f64) -> Duration {
    let span = (to - from).as_nanos() as f64;

    from + Duration::from_nanos((span * fraction) as u64)
}

fn nanos(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_nanos(value.min(u64::MAX as f64) as u64)
    } else {
        Duration::ZERO
    }
}
