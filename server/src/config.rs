//! Relay Configuration
//!
//! Loads configuration from environment variables.
//!
//! Required:
//! - `RELAY_FEEDBACK_TIMEOUT_MS`: feedback gap after which a link estimate decays
//!
//! Optional (defaults in parentheses):
//! - `BIND_ADDRESS` (`0.0.0.0:8080`): control API
//! - `MEDIA_BIND_ADDRESS` (`0.0.0.0:7000`): UDP media socket
//! - `RELAY_MAX_ROOMS` (1000), `RELAY_MAX_PARTICIPANTS` (25), `RELAY_MAX_STREAMS` (75)
//! - `RELAY_FEEDBACK_INTERVAL_MS` (100)
//! - `RELAY_PARTICIPANT_TIMEOUT_MS` (10000)
//! - `RELAY_KEYFRAME_INTERVAL_MS` (500)
//! - `RELAY_WORKERS` (available parallelism), `RELAY_QUEUE_DEPTH` (1024)
//! - `RELAY_BWE_FLOOR_BPS` (50000), `RELAY_BWE_CEILING_BPS` (20000000),
//!   `RELAY_BWE_INITIAL_BPS` (300000), `RELAY_BWE_INCREASE_BPS` (50000),
//!   `RELAY_BWE_DECREASE_FACTOR` (0.85), `RELAY_BWE_DECAY_FACTOR` (0.5),
//!   `RELAY_BWE_OVERUSE_MS` (2.0), `RELAY_BWE_SMOOTHING` (0.6)
//! - `RELAY_HYSTERESIS_UP` (0.0), `RELAY_HYSTERESIS_DOWN` (0.0)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// UDP media socket bind address
    pub media_bind_address: String,

    /// Maximum concurrently active rooms
    pub max_rooms: usize,

    /// Maximum participants per room
    pub max_participants_per_room: usize,

    /// Maximum negotiated streams per room
    pub max_streams_per_room: usize,

    /// Interval between uplink reports, decay checks and reselection
    pub feedback_interval: Duration,

    /// Feedback gap after which a link estimate starts decaying
    pub feedback_timeout: Duration,

    /// Inactivity after which a participant is torn down
    pub participant_timeout: Duration,

    /// Minimum spacing of relay-originated keyframe requests per stream
    pub keyframe_request_interval: Duration,

    /// Number of media worker tasks
    pub worker_count: usize,

    /// Datagrams buffered per worker before ingress starts dropping
    pub worker_queue_depth: usize,

    /// Bandwidth estimator tuning
    pub estimator: EstimatorConfig,

    /// Layer switch hysteresis
    pub hysteresis: HysteresisConfig,
}

/// Bandwidth estimator tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// Lowest estimate; feedback-gap decay converges here.
    pub floor_bps: u64,
    /// Highest estimate.
    pub ceiling_bps: u64,
    /// Estimate of a freshly created link.
    pub initial_bps: u64,
    /// Additive increase per report under normal conditions.
    pub increase_bps: u64,
    /// Multiplicative decrease applied on overuse or heavy loss.
    pub decrease_factor: f64,
    /// Fraction of the distance to the floor kept per interval during a
    /// feedback gap.
    pub decay_factor: f64,
    /// Smoothed delay gradient (ms per packet group) that counts as overuse.
    pub overuse_threshold_ms: f64,
    /// Weight of the previous trend in the delay gradient filter.
    pub smoothing: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            floor_bps: 50_000,
            ceiling_bps: 20_000_000,
            initial_bps: 300_000,
            increase_bps: 50_000,
            decrease_factor: 0.85,
            decay_factor: 0.5,
            overuse_threshold_ms: 2.0,
            smoothing: 0.6,
        }
    }
}

impl EstimatorConfig {
    fn validate(&self) -> Result<()> {
        if self.floor_bps > self.ceiling_bps {
            bail!("RELAY_BWE_FLOOR_BPS must not exceed RELAY_BWE_CEILING_BPS");
        }
        if !(self.floor_bps..=self.ceiling_bps).contains(&self.initial_bps) {
            bail!("RELAY_BWE_INITIAL_BPS must lie between floor and ceiling");
        }
        for (name, value) in [
            ("RELAY_BWE_DECREASE_FACTOR", self.decrease_factor),
            ("RELAY_BWE_DECAY_FACTOR", self.decay_factor),
            ("RELAY_BWE_SMOOTHING", self.smoothing),
        ] {
            if !(0.0..1.0).contains(&value) {
                bail!("{name} must be in [0, 1)");
            }
        }
        if self.overuse_threshold_ms <= 0.0 {
            bail!("RELAY_BWE_OVERUSE_MS must be positive");
        }
        Ok(())
    }
}

/// Margins that keep the selected layer from oscillating around a threshold.
///
/// Both margins are fractions of a layer's bitrate; zero disables them.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HysteresisConfig {
    /// Extra headroom required before switching up to a layer.
    pub up_margin: f64,
    /// Shortfall tolerated before switching down from the current layer.
    pub down_margin: f64,
}

impl HysteresisConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.up_margin) || !(0.0..1.0).contains(&self.down_margin) {
            bail!("hysteresis margins must be in [0, 1)");
        }
        Ok(())
    }
}

fn var_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn millis_or(name: &str, default: u64) -> Duration {
    Duration::from_millis(var_or(name, default))
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(4, usize::from)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let feedback_timeout_ms: u64 = env::var("RELAY_FEEDBACK_TIMEOUT_MS")
            .context("RELAY_FEEDBACK_TIMEOUT_MS must be set")?
            .parse()
            .context("RELAY_FEEDBACK_TIMEOUT_MS must be a number of milliseconds")?;

        let defaults = EstimatorConfig::default();
        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            media_bind_address: env::var("MEDIA_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:7000".into()),
            max_rooms: var_or("RELAY_MAX_ROOMS", 1000),
            max_participants_per_room: var_or("RELAY_MAX_PARTICIPANTS", 25),
            max_streams_per_room: var_or("RELAY_MAX_STREAMS", 75),
            feedback_interval: millis_or("RELAY_FEEDBACK_INTERVAL_MS", 100),
            feedback_timeout: Duration::from_millis(feedback_timeout_ms),
            participant_timeout: millis_or("RELAY_PARTICIPANT_TIMEOUT_MS", 10_000),
            keyframe_request_interval: millis_or("RELAY_KEYFRAME_INTERVAL_MS", 500),
            worker_count: var_or("RELAY_WORKERS", default_workers()).max(1),
            worker_queue_depth: var_or("RELAY_QUEUE_DEPTH", 1024).max(1),
            estimator: EstimatorConfig {
                floor_bps: var_or("RELAY_BWE_FLOOR_BPS", defaults.floor_bps),
                ceiling_bps: var_or("RELAY_BWE_CEILING_BPS", defaults.ceiling_bps),
                initial_bps: var_or("RELAY_BWE_INITIAL_BPS", defaults.initial_bps),
                increase_bps: var_or("RELAY_BWE_INCREASE_BPS", defaults.increase_bps),
                decrease_factor: var_or("RELAY_BWE_DECREASE_FACTOR", defaults.decrease_factor),
                decay_factor: var_or("RELAY_BWE_DECAY_FACTOR", defaults.decay_factor),
                overuse_threshold_ms: var_or("RELAY_BWE_OVERUSE_MS", defaults.overuse_threshold_ms),
                smoothing: var_or("RELAY_BWE_SMOOTHING", defaults.smoothing),
            },
            hysteresis: HysteresisConfig {
                up_margin: var_or("RELAY_HYSTERESIS_UP", 0.0),
                down_margin: var_or("RELAY_HYSTERESIS_DOWN", 0.0),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.feedback_timeout.is_zero() {
            bail!("RELAY_FEEDBACK_TIMEOUT_MS must be positive");
        }
        if self.feedback_interval.is_zero() {
            bail!("RELAY_FEEDBACK_INTERVAL_MS must be positive");
        }
        self.estimator.validate()?;
        self.hysteresis.validate()
    }

    /// Create a default configuration for testing.
    ///
    /// Binds to loopback with ephemeral ports and uses a short feedback timeout.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            media_bind_address: "127.0.0.1:0".into(),
            max_rooms: 16,
            max_participants_per_room: 8,
            max_streams_per_room: 16,
            feedback_interval: Duration::from_millis(100),
            feedback_timeout: Duration::from_millis(500),
            participant_timeout: Duration::from_secs(10),
            keyframe_request_interval: Duration::from_millis(500),
            worker_count: 2,
            worker_queue_depth: 64,
            estimator: EstimatorConfig::default(),
            hysteresis: HysteresisConfig::default(),
        }
    }
}
