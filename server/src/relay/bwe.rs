//! Bandwidth estimation.
//!
//! [`CongestionController`] is the seam between links and the estimation
//! algorithm. [`GccEstimator`] is the production implementation: a delay
//! gradient detector driving an additive-increase / multiplicative-decrease
//! rate controller, with loss-based backoff and decay towards a floor when
//! feedback stops.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;

/// Packets sent within this span form one group for delay measurements.
const BURST_US: i64 = 5_000;

/// Loss above this fraction triggers a decrease.
const HIGH_LOSS: f64 = 0.10;

/// Loss above this fraction blocks increases.
const LOW_LOSS: f64 = 0.02;

/// A bitrate in bits per second.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bitrate(u64);

impl Bitrate {
    /// Zero bits per second.
    pub const ZERO: Self = Self(0);

    /// From bits per second.
    #[must_use]
    pub const fn bps(bps: u64) -> Self {
        Self(bps)
    }

    /// From kilobits per second.
    #[must_use]
    pub const fn kbps(kbps: u64) -> Self {
        Self(kbps * 1000)
    }

    /// Bits per second.
    #[must_use]
    pub const fn as_bps(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            write!(f, "{:.2} Mbps", self.0 as f64 / 1e6)
        } else {
            write!(f, "{} kbps", self.0 / 1000)
        }
    }
}

/// Outcome of one packet, as seen by the estimator.
///
/// Send and arrival times are on different clocks; only differences within
/// each clock are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketResult {
    /// Sequence number.
    pub sequence: u32,
    /// Send time in microseconds on the sender's clock.
    pub send_time_us: i64,
    /// Arrival time in microseconds on the receiver's clock, `None` if lost.
    pub arrival_us: Option<i64>,
    /// Datagram size in bytes.
    pub size: usize,
}

/// Congestion controller of one directional link.
pub trait CongestionController: Send {
    /// Consume per-packet results from a congestion report.
    fn ingest(&mut self, results: &[PacketResult], now: Instant) -> Bitrate;

    /// Consume a receiver-computed maximum rate.
    fn ingest_receiver_estimate(&mut self, bitrate: Bitrate, now: Instant) -> Bitrate;

    /// Periodic check; decays the estimate when feedback has stopped.
    fn on_tick(&mut self, now: Instant) -> Bitrate;

    /// Current estimate.
    fn estimate(&self) -> Bitrate;
}

/// Builds the controller of a new link.
pub type ControllerFactory =
    Arc<dyn Fn(Instant) -> Box<dyn CongestionController> + Send + Sync>;

/// Factory producing [`GccEstimator`]s.
#[must_use]
pub fn gcc_factory(config: EstimatorConfig, feedback_timeout: Duration) -> ControllerFactory {
    Arc::new(move |now| Box::new(GccEstimator::new(config, feedback_timeout, now)))
}

/// State of the delay gradient detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthUsage {
    /// Queuing delay is stable.
    Normal,
    /// Queuing delay is growing.
    Overusing,
    /// Queuing delay is draining.
    Underusing,
}

/// Delay-gradient AIMD estimator.
#[derive(Debug)]
pub struct GccEstimator {
    config: EstimatorConfig,
    feedback_timeout: Duration,
    estimate: u64,
    trend_ms: f64,
    usage: BandwidthUsage,
    last_feedback: Instant,
}

impl GccEstimator {
    /// Create an estimator starting at the configured initial rate.
    #[must_use]
    pub fn new(config: EstimatorConfig, feedback_timeout: Duration, now: Instant) -> Self {
        Self {
            config,
            feedback_timeout,
            estimate: config.initial_bps.clamp(config.floor_bps, config.ceiling_bps),
            trend_ms: 0.0,
            usage: BandwidthUsage::Normal,
            last_feedback: now,
        }
    }

    /// Current detector state.
    #[must_use]
    pub const fn usage(&self) -> BandwidthUsage {
        self.usage
    }

    fn clamp(&self, bps: u64) -> u64 {
        bps.clamp(self.config.floor_bps, self.config.ceiling_bps)
    }

    /// Mean inter-group delay variation in milliseconds, if measurable.
    fn delay_gradient(results: &[PacketResult]) -> Option<f64> {
        // (first send, last send, last arrival) per group
        let mut groups: Vec<(i64, i64, i64)> = Vec::new();
        for result in results {
            let Some(arrival) = result.arrival_us else {
                continue;
            };
            match groups.last_mut() {
                Some(group) if (result.send_time_us - group.0).abs() <= BURST_US => {
                    group.1 = group.1.max(result.send_time_us);
                    group.2 = group.2.max(arrival);
                }
                _ => groups.push((result.send_time_us, result.send_time_us, arrival)),
            }
        }

        if groups.len() < 2 {
            return None;
        }
        let sum: f64 = groups
            .windows(2)
            .map(|pair| {
                let send_delta = pair[1].1 - pair[0].1;
                let arrival_delta = pair[1].2 - pair[0].2;
                (arrival_delta - send_delta) as f64 / 1000.0
            })
            .sum();
        Some(sum / (groups.len() - 1) as f64)
    }
}

impl CongestionController for GccEstimator {
    fn ingest(&mut self, results: &[PacketResult], now: Instant) -> Bitrate {
        self.last_feedback = now;
        if results.is_empty() {
            return self.estimate();
        }

        let lost = results.iter().filter(|r| r.arrival_us.is_none()).count();
        let loss = lost as f64 / results.len() as f64;

        if let Some(gradient) = Self::delay_gradient(results) {
            self.trend_ms =
                self.config.smoothing * self.trend_ms + (1.0 - self.config.smoothing) * gradient;
        }
        self.usage = if self.trend_ms > self.config.overuse_threshold_ms {
            BandwidthUsage::Overusing
        } else if self.trend_ms < -self.config.overuse_threshold_ms {
            BandwidthUsage::Underusing
        } else {
            BandwidthUsage::Normal
        };

        let next = if self.usage == BandwidthUsage::Overusing || loss > HIGH_LOSS {
            (self.estimate as f64 * self.config.decrease_factor) as u64
        } else if self.usage == BandwidthUsage::Underusing || loss > LOW_LOSS {
            self.estimate
        } else {
            self.estimate.saturating_add(self.config.increase_bps)
        };
        self.estimate = self.clamp(next);
        self.estimate()
    }

    fn ingest_receiver_estimate(&mut self, bitrate: Bitrate, now: Instant) -> Bitrate {
        self.last_feedback = now;
        self.estimate = self.clamp(bitrate.as_bps());
        self.estimate()
    }

    fn on_tick(&mut self, now: Instant) -> Bitrate {
        if now.saturating_duration_since(self.last_feedback) > self.feedback_timeout {
            let floor = self.config.floor_bps;
            let above = self.estimate.saturating_sub(floor);
            self.estimate = floor + (above as f64 * self.config.decay_factor).floor() as u64;
        }
        self.estimate()
    }

    fn estimate(&self) -> Bitrate {
        Bitrate::bps(self.estimate)
    }
}
