//! # Configuration
//!
//! TOML-loadable configuration for a DTP endpoint. Every field is optional in
//! the input form; [`DtpConfigInput::resolve`] fills defaults and validates.
//!
//! ```toml
//! version = 1
//!
//! [scheduler]
//! max_queue_size = 1000
//! batch_size = 10
//! batch_timeout_ms = 50
//!
//! [deadlines]
//! critical_ms = 500
//! low_ms = 6000
//!
//! [admission]
//! enforce_critical_limit = true
//! [admission.high]
//! rate = 200.0
//! burst = 50
//!
//! [congestion]
//! initial_rate = 500.0
//! loss_threshold = 0.02
//!
//! [clock_sync]
//! num_samples = 5
//! ```

use serde::Deserialize;
use thiserror::Error;

use crate::admission::{AdmissionConfig, TokenBucketConfig};
use crate::clock_sync::ClockSyncConfig;
use crate::congestion::CongestionConfig;
use crate::scheduler::SchedulerConfig;
use crate::wire::Priority;

pub const CONFIG_VERSION: u32 = 1;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("{field} must be positive and finite, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("min_rate {min} exceeds max_rate {max}")]
    RateBounds { min: f64, max: f64 },
}

/// Fails unless `value` is finite and strictly positive.
pub(crate) fn ensure_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field, value })
    }
}

pub(crate) fn ensure_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

// ─── Deadlines ──────────────────────────────────────────────────────────────

/// Per-priority deadline budgets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineTable {
    deadlines_ms: [u64; 4],
}

impl DeadlineTable {
    pub fn new(critical: u64, high: u64, medium: u64, low: u64) -> Self {
        DeadlineTable {
            deadlines_ms: [critical, high, medium, low],
        }
    }

    pub fn get(&self, priority: Priority) -> u64 {
        self.deadlines_ms[priority.index()]
    }

    pub fn set(&mut self, priority: Priority, deadline_ms: u64) {
        self.deadlines_ms[priority.index()] = deadline_ms;
    }

    /// Every budget must be at least 1 ms and fit the 32-bit wire field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for p in Priority::ALL {
            ensure_range(
                deadline_field(p),
                self.get(p) as f64,
                MIN_DEADLINE_MS as f64,
                u32::MAX as f64,
            )?;
        }
        Ok(())
    }
}

const MIN_DEADLINE_MS: u64 = 1;

fn deadline_field(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "deadlines.critical_ms",
        Priority::High => "deadlines.high_ms",
        Priority::Medium => "deadlines.medium_ms",
        Priority::Low => "deadlines.low_ms",
    }
}

impl Default for DeadlineTable {
    fn default() -> Self {
        let mut deadlines_ms = [0; 4];
        for p in Priority::ALL {
            deadlines_ms[p.index()] = p.default_deadline_ms();
        }
        DeadlineTable { deadlines_ms }
    }
}

// ─── Input (all optional) ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DtpConfigInput {
    pub version: u32,
    pub scheduler: SchedulerConfigInput,
    pub deadlines: DeadlinesInput,
    pub admission: AdmissionConfigInput,
    pub congestion: CongestionConfigInput,
    pub clock_sync: ClockSyncConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SchedulerConfigInput {
    pub max_queue_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub batching: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeadlinesInput {
    pub critical_ms: Option<u64>,
    pub high_ms: Option<u64>,
    pub medium_ms: Option<u64>,
    pub low_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BucketInput {
    pub rate: Option<f64>,
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdmissionConfigInput {
    pub enforce_critical_limit: Option<bool>,
    pub critical: BucketInput,
    pub high: BucketInput,
    pub medium: BucketInput,
    pub low: BucketInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CongestionConfigInput {
    pub initial_rate: Option<f64>,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub additive_increase: Option<f64>,
    pub multiplicative_decrease: Option<f64>,
    pub loss_threshold: Option<f64>,
    pub window_ms: Option<u64>,
    pub latency_threshold_ms: Option<f64>,
    pub notice_hold_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfigInput {
    pub num_samples: Option<usize>,
    pub min_samples: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub interval_ms: Option<u64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Validated configuration for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct DtpConfig {
    pub scheduler: SchedulerConfig,
    pub deadlines: DeadlineTable,
    pub admission: AdmissionConfig,
    pub congestion: CongestionConfig,
    pub clock_sync: ClockSyncConfig,
}

impl DtpConfigInput {
    pub fn resolve(self) -> Result<DtpConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let sched_default = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            max_queue_size: self
                .scheduler
                .max_queue_size
                .unwrap_or(sched_default.max_queue_size),
            batch_size: self.scheduler.batch_size.unwrap_or(sched_default.batch_size),
            batch_timeout_ms: self
                .scheduler
                .batch_timeout_ms
                .unwrap_or(sched_default.batch_timeout_ms),
            batching: self.scheduler.batching.unwrap_or(sched_default.batching),
        };
        scheduler.validate()?;

        let mut deadlines = DeadlineTable::default();
        let d = &self.deadlines;
        for (p, v) in [
            (Priority::Critical, d.critical_ms),
            (Priority::High, d.high_ms),
            (Priority::Medium, d.medium_ms),
            (Priority::Low, d.low_ms),
        ] {
            if let Some(ms) = v {
                deadlines.set(p, ms);
            }
        }
        deadlines.validate()?;

        let mut admission = AdmissionConfig::default();
        if let Some(enforce) = self.admission.enforce_critical_limit {
            admission.enforce_critical_limit = enforce;
        }
        let a = &self.admission;
        for (p, input) in [
            (Priority::Critical, &a.critical),
            (Priority::High, &a.high),
            (Priority::Medium, &a.medium),
            (Priority::Low, &a.low),
        ] {
            let base = admission.limit(p);
            admission.set_limit(
                p,
                TokenBucketConfig {
                    rate: input.rate.unwrap_or(base.rate),
                    burst: input.burst.unwrap_or(base.burst),
                },
            );
        }
        admission.validate()?;

        let c = &self.congestion;
        let base = CongestionConfig::default();
        let congestion = CongestionConfig {
            initial_rate: c.initial_rate.unwrap_or(base.initial_rate),
            min_rate: c.min_rate.unwrap_or(base.min_rate),
            max_rate: c.max_rate.unwrap_or(base.max_rate),
            additive_increase: c.additive_increase.unwrap_or(base.additive_increase),
            multiplicative_decrease: c
                .multiplicative_decrease
                .unwrap_or(base.multiplicative_decrease),
            loss_threshold: c.loss_threshold.unwrap_or(base.loss_threshold),
            window_ms: c.window_ms.unwrap_or(base.window_ms),
            latency_threshold_ms: c.latency_threshold_ms.unwrap_or(base.latency_threshold_ms),
            notice_hold_ms: c.notice_hold_ms.unwrap_or(base.notice_hold_ms),
        };
        congestion.validate()?;

        let s = &self.clock_sync;
        let base = ClockSyncConfig::default();
        let clock_sync = ClockSyncConfig {
            num_samples: s.num_samples.unwrap_or(base.num_samples),
            min_samples: s.min_samples.unwrap_or(base.min_samples),
            timeout_ms: s.timeout_ms.unwrap_or(base.timeout_ms),
            interval_ms: s.interval_ms.unwrap_or(base.interval_ms),
        };
        clock_sync.validate()?;

        Ok(DtpConfig {
            scheduler,
            deadlines,
            admission,
            congestion,
            clock_sync,
        })
    }
}

impl DtpConfig {
    /// Parse and resolve a TOML document. Empty input yields defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(DtpConfig::default());
        }
        let parsed: DtpConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = DtpConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg.scheduler.max_queue_size, 1000);
        assert_eq!(cfg.scheduler.batch_size, 10);
        assert_eq!(cfg.scheduler.batch_timeout_ms, 50);
        assert_eq!(cfg.deadlines.get(Priority::Critical), 500);
        assert_eq!(cfg.deadlines.get(Priority::Low), 6_000);
        assert_eq!(cfg.admission.limit(Priority::Medium).rate, 500.0);
        assert_eq!(cfg.congestion.initial_rate, 500.0);
        assert_eq!(cfg.clock_sync.num_samples, 5);
    }

    #[test]
    fn parse_partial_overrides() {
        let toml = r#"
            version = 1

            [scheduler]
            max_queue_size = 64
            batch_timeout_ms = 20

            [deadlines]
            high_ms = 900

            [admission]
            enforce_critical_limit = false
            [admission.low]
            burst = 400

            [congestion]
            max_rate = 2000.0
            multiplicative_decrease = 0.3

            [clock_sync]
            num_samples = 9
            timeout_ms = 250
        "#;
        let cfg = DtpConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.scheduler.max_queue_size, 64);
        assert_eq!(cfg.scheduler.batch_size, 10);
        assert_eq!(cfg.scheduler.batch_timeout_ms, 20);
        assert_eq!(cfg.deadlines.get(Priority::High), 900);
        assert_eq!(cfg.deadlines.get(Priority::Medium), 3_000);
        assert!(!cfg.admission.enforce_critical_limit);
        assert_eq!(cfg.admission.limit(Priority::Low).burst, 400);
        assert_eq!(cfg.admission.limit(Priority::Low).rate, 1_000.0);
        assert_eq!(cfg.congestion.max_rate, 2_000.0);
        assert_eq!(cfg.congestion.multiplicative_decrease, 0.3);
        assert_eq!(cfg.clock_sync.num_samples, 9);
        assert_eq!(cfg.clock_sync.timeout_ms, 250);
    }

    #[test]
    fn rejects_unknown_version() {
        let err = DtpConfig::from_toml_str("version = 7").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_bad_toml() {
        let err = DtpConfig::from_toml_str("[scheduler\nmax_queue_size = ").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn rejects_non_positive_rate() {
        let toml = r#"
            [admission.high]
            rate = 0.0
        "#;
        let err = DtpConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::NotPositive { .. }), "{err}");
    }

    #[test]
    fn rejects_inverted_rate_bounds() {
        let toml = r#"
            [congestion]
            min_rate = 900.0
            max_rate = 100.0
            initial_rate = 100.0
        "#;
        let err = DtpConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::RateBounds { .. }), "{err}");
    }

    #[test]
    fn rejects_deadline_wider_than_wire_field() {
        let toml = "[deadlines]\nhigh_ms = 5000000000\n";
        let err = DtpConfig::from_toml_str(toml).unwrap_err();
        assert!(
            matches!(
                err,
                ConfigError::OutOfRange { field: "deadlines.high_ms", .. }
            ),
            "{err}"
        );

        let edge = format!("[deadlines]\nhigh_ms = {}\n", u32::MAX);
        let cfg = DtpConfig::from_toml_str(&edge).unwrap();
        assert_eq!(cfg.deadlines.get(Priority::High), u64::from(u32::MAX));
    }

    #[test]
    fn rejects_zero_deadline() {
        let err = DtpConfig::from_toml_str("[deadlines]\nlow_ms = 0\n").unwrap_err();
        assert!(
            matches!(err, ConfigError::OutOfRange { field: "deadlines.low_ms", .. }),
            "{err}"
        );
    }

    #[test]
    fn rejects_zero_queue() {
        let toml = "[scheduler]\nmax_queue_size = 0\n";
        assert!(DtpConfig::from_toml_str(toml).is_err());
    }
}
