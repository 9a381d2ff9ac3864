//! Engine configuration.
//!
//! Every knob lives in one [`EngineConfig`], built via its
//! [`EngineConfigBuilder`]. Keeping the whole surface in a single struct
//! makes it trivial to share across tasks, serialise for logging, and diff
//! two deployments to understand why their behaviour differs.
//!
//! Validation happens at [`EngineConfigBuilder::build`] (and again at
//! engine startup): a backend that boots with a nonsensical threshold
//! ladder or a zero attempt budget would fail in confusing ways hours
//! later, so those are rejected before the engine ever starts.

use serde::Serialize;

use crate::error::EngineError;

/// Configuration for the job engine.
///
/// Built via [`EngineConfig::builder()`] or using
/// [`EngineConfig::default()`].
///
/// # Example
/// ```rust
/// use pulpmill::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .concurrency(8)
///     .max_attempts(3)
///     .default_chunk_size(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    // ── Queue / scheduler ─────────────────────────────────────────────────

    /// Base number of jobs that may run concurrently. Default: 4.
    ///
    /// Conversions are memory-bound, not CPU-bound: each active job holds a
    /// source document plus conversion state. Four keeps a mid-size backend
    /// responsive; raise it on hosts with plenty of headroom and the memory
    /// monitor will throttle it back down if that turns out optimistic.
    pub concurrency: usize,

    /// Total attempts a job gets before failing terminally. Default: 3.
    ///
    /// Converter and storage faults are overwhelmingly transient; a second
    /// or third run usually succeeds. Structural failures (chunk assembly
    /// inconsistencies) ignore this budget and fail on the first occurrence.
    pub max_attempts: u32,

    /// Priority increment applied on every retry. Default: 1.
    ///
    /// A retried job has already waited through one full run; boosting it
    /// keeps old work from starving behind a steady stream of fresh
    /// submissions. Must be at least 1 so each retry outranks the last.
    pub retry_priority_boost: i32,

    /// Multiplier applied to the concurrency limit on a critical memory
    /// signal. Default: 0.5.
    ///
    /// Halving is aggressive on purpose: by the time usage crosses the
    /// critical threshold, finishing the jobs already running is worth more
    /// than starting new ones. The limit never drops below 1 and recovers
    /// one step per healthy signal rather than snapping back, which stops
    /// the limit oscillating when usage hovers around a threshold.
    pub throttle_factor: f64,

    /// How many completed and failed job records to retain, each. Default: 256.
    ///
    /// Pollers usually fetch a result within seconds of completion; the logs
    /// exist to absorb slow pollers, not to be a database. Oldest entries
    /// are evicted first.
    pub result_retention: usize,

    /// Per-job wall-clock deadline in milliseconds. Default: none.
    ///
    /// When set, an attempt that outruns the deadline is cancelled, fails
    /// with a retryable deadline error, and frees its concurrency slot.
    /// Left off by default because legitimate conversion times vary by
    /// orders of magnitude with document size.
    pub job_deadline_ms: Option<u64>,

    // ── Memory monitor ────────────────────────────────────────────────────

    /// Usage percentages where pressure classification changes.
    pub thresholds: PressureThresholds,

    /// Memory samples kept for trend detection. Default: 20.
    pub history_capacity: usize,

    /// Interval between periodic memory samples in milliseconds. Default: 5000.
    pub sample_interval_ms: u64,

    /// Age after which registered cache entries are pruned during
    /// reclamation, in seconds. Default: 1800 (30 minutes).
    pub cache_ttl_secs: u64,

    /// Pause between cache pruning and the post-reclaim sample, in
    /// milliseconds. Default: 100.
    ///
    /// Freed allocations take a moment to show up in RSS; sampling
    /// immediately would report zero bytes reclaimed on every run.
    pub reclaim_settle_ms: u64,

    /// What a degraded memory sample reports after repeated probe failures.
    /// Default: [`MonitorFailurePolicy::FailClosed`].
    pub monitor_failure_policy: MonitorFailurePolicy,

    /// Consecutive probe failures tolerated before the failure policy kicks
    /// in. Default: 3.
    ///
    /// A single failed read is noise (procfs hiccup, transient EPERM).
    /// Three in a row means the probe is actually broken.
    pub monitor_failure_tolerance: u32,

    // ── Chunking ──────────────────────────────────────────────────────────

    /// Documents at or below this page count are never chunked. Default: 10.
    ///
    /// Chunking buys memory headroom at the cost of extra extract/upload
    /// round-trips and an assembly step. Below ~10 pages the overhead
    /// exceeds the savings for every format we convert.
    pub min_chunkable_pages: u32,

    /// Pages per chunk under healthy memory. Default: 5.
    ///
    /// Halved under critical pressure, forced to single-page chunks under
    /// emergency.
    pub default_chunk_size: u32,

    /// Source size above which a chunkable document is always chunked.
    /// Default: 20 MiB.
    pub large_document_bytes: u64,

    /// Chunks of one job processed at once. Default: 1 (serial).
    ///
    /// The whole job still occupies a single queue slot; this only bounds
    /// in-job parallelism. Keep it small — chunking exists to cap memory,
    /// and N parallel chunks hold N extracted sub-documents.
    pub chunk_concurrency: usize,

    // ── Executor ──────────────────────────────────────────────────────────

    /// Upload attempts per artifact before the job attempt fails. Default: 3.
    pub upload_retries: u32,

    /// Initial upload retry delay in milliseconds (exponential backoff).
    /// Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s. Backoff avoids
    /// hammering a storage backend that is already struggling.
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            retry_priority_boost: 1,
            throttle_factor: 0.5,
            result_retention: 256,
            job_deadline_ms: None,
            thresholds: PressureThresholds::default(),
            history_capacity: 20,
            sample_interval_ms: 5_000,
            cache_ttl_secs: 1_800,
            reclaim_settle_ms: 100,
            monitor_failure_policy: MonitorFailurePolicy::default(),
            monitor_failure_tolerance: 3,
            min_chunkable_pages: 10,
            default_chunk_size: 5,
            large_document_bytes: 20 * 1024 * 1024,
            chunk_concurrency: 1,
            upload_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for `EngineConfig`.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Checks cross-field constraints.
    ///
    /// Called by [`EngineConfigBuilder::build`] and again by
    /// [`crate::engine::Engine::start`], since the fields are public and a
    /// config may have been edited after building.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.thresholds.validate().map_err(EngineError::InvalidConfig)?;
        if self.concurrency == 0 {
            return Err(EngineError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("max_attempts must be ≥ 1".into()));
        }
        if self.retry_priority_boost < 1 {
            return Err(EngineError::InvalidConfig(
                "retry_priority_boost must be ≥ 1 so every retry outranks the previous attempt"
                    .into(),
            ));
        }
        if !(self.throttle_factor > 0.0 && self.throttle_factor < 1.0) {
            return Err(EngineError::InvalidConfig(format!(
                "throttle_factor must be in (0, 1), got {}",
                self.throttle_factor
            )));
        }
        if self.default_chunk_size == 0 {
            return Err(EngineError::InvalidConfig(
                "default_chunk_size must be ≥ 1".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "history_capacity must be ≥ 1".into(),
            ));
        }
        if self.result_retention == 0 {
            return Err(EngineError::InvalidConfig(
                "result_retention must be ≥ 1".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n.max(1);
        self
    }

    pub fn retry_priority_boost(mut self, boost: i32) -> Self {
        self.config.retry_priority_boost = boost.max(1);
        self
    }

    pub fn throttle_factor(mut self, factor: f64) -> Self {
        self.config.throttle_factor = factor;
        self
    }

    pub fn result_retention(mut self, n: usize) -> Self {
        self.config.result_retention = n.max(1);
        self
    }

    pub fn job_deadline_ms(mut self, ms: u64) -> Self {
        self.config.job_deadline_ms = Some(ms);
        self
    }

    pub fn thresholds(mut self, thresholds: PressureThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    pub fn history_capacity(mut self, n: usize) -> Self {
        self.config.history_capacity = n.max(1);
        self
    }

    pub fn sample_interval_ms(mut self, ms: u64) -> Self {
        self.config.sample_interval_ms = ms.max(1);
        self
    }

    pub fn cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.cache_ttl_secs = secs;
        self
    }

    pub fn reclaim_settle_ms(mut self, ms: u64) -> Self {
        self.config.reclaim_settle_ms = ms;
        self
    }

    pub fn monitor_failure_policy(mut self, policy: MonitorFailurePolicy) -> Self {
        self.config.monitor_failure_policy = policy;
        self
    }

    pub fn monitor_failure_tolerance(mut self, n: u32) -> Self {
        self.config.monitor_failure_tolerance = n.max(1);
        self
    }

    pub fn min_chunkable_pages(mut self, pages: u32) -> Self {
        self.config.min_chunkable_pages = pages;
        self
    }

    pub fn default_chunk_size(mut self, pages: u32) -> Self {
        self.config.default_chunk_size = pages.max(1);
        self
    }

    pub fn large_document_bytes(mut self, bytes: u64) -> Self {
        self.config.large_document_bytes = bytes;
        self
    }

    pub fn chunk_concurrency(mut self, n: usize) -> Self {
        self.config.chunk_concurrency = n.max(1);
        self
    }

    pub fn upload_retries(mut self, n: u32) -> Self {
        self.config.upload_retries = n.max(1);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Memory policy types ──────────────────────────────────────────────────

/// Ascending usage percentages where memory pressure classification changes.
///
/// Usage below `warning` is healthy; at or above `emergency` the scheduler
/// stops dispatching entirely. Defaults approximate the points where a
/// conversion backend should start caring (65), act (80), and stop (90).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warning: 65.0,
            critical: 80.0,
            emergency: 90.0,
        }
    }
}

impl PressureThresholds {
    pub fn new(warning: f64, critical: f64, emergency: f64) -> Self {
        Self {
            warning,
            critical,
            emergency,
        }
    }

    /// Checks the ladder is strictly ascending within (0, 100].
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !(self.warning > 0.0 && self.emergency <= 100.0) {
            return Err(format!(
                "pressure thresholds must lie in (0, 100], got {}/{}/{}",
                self.warning, self.critical, self.emergency
            ));
        }
        if !(self.warning < self.critical && self.critical < self.emergency) {
            return Err(format!(
                "pressure thresholds must be strictly ascending, got {}/{}/{}",
                self.warning, self.critical, self.emergency
            ));
        }
        Ok(())
    }
}

/// What degraded memory samples report once the probe has failed repeatedly.
///
/// The monitor itself never errors; this decides which way it leans when it
/// cannot see real numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum MonitorFailurePolicy {
    /// Degraded samples classify as emergency, pausing job intake until the
    /// probe recovers. The safe default: a backend that cannot see its own
    /// memory should not pile on more work.
    #[default]
    FailClosed,
    /// Degraded samples classify as healthy and scheduling continues
    /// unthrottled. For hosts with external memory protection (cgroup
    /// limits with headroom, supervisor restarts).
    FailOpen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = EngineConfig::builder().build().unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.default_chunk_size, 5);
        assert!(config.job_deadline_ms.is_none());
    }

    #[test]
    fn setters_clamp_to_sane_floors() {
        let config = EngineConfig::builder()
            .concurrency(0)
            .max_attempts(0)
            .default_chunk_size(0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.default_chunk_size, 1);
    }

    #[test]
    fn descending_thresholds_rejected() {
        let err = EngineConfig::builder()
            .thresholds(PressureThresholds::new(90.0, 80.0, 65.0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ascending"), "got: {err}");
    }

    #[test]
    fn out_of_range_thresholds_rejected() {
        let err = EngineConfig::builder()
            .thresholds(PressureThresholds::new(65.0, 80.0, 130.0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("(0, 100]"), "got: {err}");
    }

    #[test]
    fn throttle_factor_must_be_a_proper_fraction() {
        let err = EngineConfig::builder()
            .throttle_factor(1.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("throttle_factor"));

        let err = EngineConfig::builder()
            .throttle_factor(0.0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("throttle_factor"));
    }
}
