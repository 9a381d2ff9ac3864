//! Memory monitoring: sampling, pressure classification, trend detection,
//! and best-effort reclamation.
//!
//! The monitor is advisory. It feeds [`MemoryPressure`] signals to the
//! scheduler, which adapts concurrency; it never blocks or fails a job
//! itself. Two rules follow from that:
//!
//! * [`MemoryMonitor::sample`] and [`MemoryMonitor::reclaim`] never return
//!   errors. A broken counter source produces a *degraded* sample whose
//!   classification follows the configured
//!   [`MonitorFailurePolicy`](crate::config::MonitorFailurePolicy), and a
//!   failed reclamation reports `success: false` with a message.
//! * Counters come through the [`MemoryProbe`] seam. Production uses
//!   [`SysinfoProbe`]; tests inject scripted counter sequences and drive
//!   every branch without touching the real system.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, System};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{EngineConfig, MonitorFailurePolicy, PressureThresholds};

/// Samples required before trend detection produces an assessment.
const TREND_MIN_SAMPLES: usize = 5;
/// Fraction of rising consecutive deltas above which a leak is suspected.
const LEAK_RATIO: f64 = 0.8;

/// Memory pressure classification, ordered from healthy to unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    Ok,
    Warning,
    Critical,
    Emergency,
}

impl MemoryPressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryPressure::Ok => "ok",
            MemoryPressure::Warning => "warning",
            MemoryPressure::Critical => "critical",
            MemoryPressure::Emergency => "emergency",
        }
    }

    /// Classifies a usage percentage against a threshold ladder.
    ///
    /// Monotone by construction: a higher percentage never maps to a lower
    /// pressure.
    pub fn classify(used_percent: f64, thresholds: &PressureThresholds) -> Self {
        if used_percent >= thresholds.emergency {
            MemoryPressure::Emergency
        } else if used_percent >= thresholds.critical {
            MemoryPressure::Critical
        } else if used_percent >= thresholds.warning {
            MemoryPressure::Warning
        } else {
            MemoryPressure::Ok
        }
    }
}

/// Raw counters from a [`MemoryProbe`], all in bytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCounters {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
}

/// One classified memory sample.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
    /// System usage in percent, clamped to [0, 100].
    pub used_percent: f64,
    pub pressure: MemoryPressure,
    /// `false` when the probe failed and the counters above are zeroes.
    pub probe_ok: bool,
}

/// The probe could not read memory counters.
#[derive(Debug, Clone, Error)]
#[error("memory probe failed: {0}")]
pub struct ProbeError(String);

impl ProbeError {
    pub fn new(message: impl Into<String>) -> Self {
        ProbeError(message.into())
    }
}

/// Source of raw memory counters.
pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Result<MemoryCounters, ProbeError>;
}

/// Production probe reading process RSS and system totals via `sysinfo`.
pub struct SysinfoProbe {
    pid: Pid,
    sys: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| ProbeError::new(format!("cannot resolve own pid: {e}")))?;
        Ok(SysinfoProbe {
            pid,
            sys: Mutex::new(System::new_all()),
        })
    }
}

impl MemoryProbe for SysinfoProbe {
    fn read(&self) -> Result<MemoryCounters, ProbeError> {
        let mut sys = self
            .sys
            .lock()
            .map_err(|_| ProbeError::new("sampler state poisoned"))?;
        sys.refresh_memory();
        sys.refresh_process(self.pid);
        let proc = sys
            .process(self.pid)
            .ok_or_else(|| ProbeError::new("own process missing from snapshot"))?;
        Ok(MemoryCounters {
            rss_bytes: proc.memory(),
            virtual_bytes: proc.virtual_memory(),
            system_total_bytes: sys.total_memory(),
            system_available_bytes: sys.available_memory(),
        })
    }
}

/// Probe used when no working probe could be constructed at startup.
struct UnavailableProbe;

impl MemoryProbe for UnavailableProbe {
    fn read(&self) -> Result<MemoryCounters, ProbeError> {
        Err(ProbeError::new("no memory probe available on this host"))
    }
}

/// A host cache the monitor may prune during reclamation.
pub trait ReclaimableCache: Send + Sync {
    fn name(&self) -> &str;

    /// Evicts entries older than `ttl`; returns how many were dropped.
    fn evict_expired(&self, ttl: Duration) -> usize;
}

/// Trend over the recent sample history.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryTrend {
    pub samples: usize,
    /// Fraction of consecutive sample pairs where usage rose.
    pub rising_ratio: f64,
    pub increasing: bool,
    /// Set when usage rose in more than 80 % of consecutive pairs — the
    /// profile of a leak rather than normal churn.
    pub leak_suspected: bool,
    pub first_percent: f64,
    pub last_percent: f64,
}

/// Result of [`MemoryMonitor::detect_trend`].
#[derive(Debug, Clone, Serialize)]
pub enum TrendAssessment {
    /// Not enough history yet to say anything.
    InsufficientData { have: usize, need: usize },
    Trend(MemoryTrend),
}

/// Result of [`MemoryMonitor::reclaim`].
#[derive(Debug, Clone, Serialize)]
pub struct ReclaimOutcome {
    pub success: bool,
    /// RSS drop observed across the reclaim, clamped at zero.
    pub reclaimed_bytes: u64,
    /// Human-readable record of what was attempted.
    pub actions: Vec<String>,
    pub message: Option<String>,
}

/// Point-in-time monitor counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub last: Option<MemoryStatus>,
    pub peak_used_percent: f64,
    pub peak_rss_bytes: u64,
    /// How long the current non-ok pressure episode has lasted.
    pub pressure_for: Option<Duration>,
    pub consecutive_probe_failures: u32,
}

struct MonitorState {
    history: VecDeque<MemoryStatus>,
    last: Option<MemoryStatus>,
    peak_used_percent: f64,
    peak_rss_bytes: u64,
    /// Set when classification left `Ok`; cleared when it returns.
    pressure_onset: Option<Instant>,
    consecutive_probe_failures: u32,
}

/// Samples memory, classifies pressure, and reclaims what it can.
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    thresholds: PressureThresholds,
    history_capacity: usize,
    cache_ttl: Duration,
    reclaim_settle: Duration,
    failure_policy: MonitorFailurePolicy,
    failure_tolerance: u32,
    caches: Mutex<Vec<Arc<dyn ReclaimableCache>>>,
    state: Mutex<MonitorState>,
}

impl MemoryMonitor {
    /// Builds a monitor on the production `sysinfo` probe.
    ///
    /// Probe construction failure is not fatal: the monitor starts degraded
    /// and the failure policy governs what its samples report.
    pub fn new(config: &EngineConfig) -> Self {
        let probe: Arc<dyn MemoryProbe> = match SysinfoProbe::new() {
            Ok(p) => Arc::new(p),
            Err(e) => {
                warn!("memory probe unavailable, samples will be degraded: {e}");
                Arc::new(UnavailableProbe)
            }
        };
        Self::with_probe(config, probe)
    }

    /// Builds a monitor on a caller-supplied probe.
    pub fn with_probe(config: &EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        MemoryMonitor {
            probe,
            thresholds: config.thresholds,
            history_capacity: config.history_capacity,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            reclaim_settle: Duration::from_millis(config.reclaim_settle_ms),
            failure_policy: config.monitor_failure_policy,
            failure_tolerance: config.monitor_failure_tolerance,
            caches: Mutex::new(Vec::new()),
            state: Mutex::new(MonitorState {
                history: VecDeque::with_capacity(config.history_capacity),
                last: None,
                peak_used_percent: 0.0,
                peak_rss_bytes: 0,
                pressure_onset: None,
                consecutive_probe_failures: 0,
            }),
        }
    }

    /// Registers a cache for TTL pruning during [`reclaim`](Self::reclaim).
    pub fn register_cache(&self, cache: Arc<dyn ReclaimableCache>) {
        lock_recovering(&self.caches).push(cache);
    }

    /// Takes one sample: read, classify, record.
    ///
    /// Healthy samples enter the trend history and update the peak metrics.
    /// Degraded samples (probe failure, zero system total) stay out of the
    /// history so trends are computed over real numbers only; their
    /// classification holds the previous level until the failure count
    /// crosses the configured tolerance, after which the failure policy
    /// decides.
    pub fn sample(&self) -> MemoryStatus {
        match self.probe.read() {
            Ok(counters) if counters.system_total_bytes > 0 => self.record_healthy(counters),
            Ok(_) => self.record_degraded("probe reported a zero system total"),
            Err(e) => self.record_degraded(&e.to_string()),
        }
    }

    fn record_healthy(&self, counters: MemoryCounters) -> MemoryStatus {
        let used = counters
            .system_total_bytes
            .saturating_sub(counters.system_available_bytes);
        let used_percent =
            (used as f64 / counters.system_total_bytes as f64 * 100.0).clamp(0.0, 100.0);
        let pressure = MemoryPressure::classify(used_percent, &self.thresholds);
        let status = MemoryStatus {
            rss_bytes: counters.rss_bytes,
            virtual_bytes: counters.virtual_bytes,
            system_total_bytes: counters.system_total_bytes,
            system_available_bytes: counters.system_available_bytes,
            used_percent,
            pressure,
            probe_ok: true,
        };

        let mut state = lock_recovering(&self.state);
        state.consecutive_probe_failures = 0;
        let previous = state.last.as_ref().map(|s| s.pressure);
        match (previous, pressure) {
            (Some(MemoryPressure::Ok) | None, p) if p != MemoryPressure::Ok => {
                state.pressure_onset = Some(Instant::now());
                debug!(used_percent, pressure = pressure.as_str(), "memory pressure onset");
            }
            (_, MemoryPressure::Ok) => state.pressure_onset = None,
            _ => {}
        }
        if used_percent > state.peak_used_percent {
            state.peak_used_percent = used_percent;
        }
        if counters.rss_bytes > state.peak_rss_bytes {
            state.peak_rss_bytes = counters.rss_bytes;
        }
        if state.history.len() == self.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(status.clone());
        state.last = Some(status.clone());
        status
    }

    fn record_degraded(&self, reason: &str) -> MemoryStatus {
        let mut state = lock_recovering(&self.state);
        state.consecutive_probe_failures += 1;
        let failures = state.consecutive_probe_failures;

        let pressure = if failures >= self.failure_tolerance {
            match self.failure_policy {
                MonitorFailurePolicy::FailClosed => MemoryPressure::Emergency,
                MonitorFailurePolicy::FailOpen => MemoryPressure::Ok,
            }
        } else {
            state
                .last
                .as_ref()
                .map(|s| s.pressure)
                .unwrap_or(MemoryPressure::Ok)
        };

        if failures == self.failure_tolerance {
            warn!(
                failures,
                policy = ?self.failure_policy,
                "memory probe failing repeatedly ({reason}); applying failure policy"
            );
        } else {
            debug!(failures, "memory probe read failed: {reason}");
        }

        let status = MemoryStatus {
            rss_bytes: 0,
            virtual_bytes: 0,
            system_total_bytes: 0,
            system_available_bytes: 0,
            used_percent: 0.0,
            pressure,
            probe_ok: false,
        };
        state.last = Some(status.clone());
        status
    }

    /// Assesses the usage trend over the recorded history.
    pub fn detect_trend(&self) -> TrendAssessment {
        let state = lock_recovering(&self.state);
        let usage: Vec<f64> = state.history.iter().map(|s| s.used_percent).collect();
        drop(state);

        if usage.len() < TREND_MIN_SAMPLES {
            return TrendAssessment::InsufficientData {
                have: usage.len(),
                need: TREND_MIN_SAMPLES,
            };
        }

        let pairs = usage.len() - 1;
        let rising = usage.windows(2).filter(|w| w[1] > w[0]).count();
        let rising_ratio = rising as f64 / pairs as f64;
        TrendAssessment::Trend(MemoryTrend {
            samples: usage.len(),
            rising_ratio,
            increasing: rising_ratio > 0.5,
            leak_suspected: rising_ratio > LEAK_RATIO,
            first_percent: usage[0],
            last_percent: usage[usage.len() - 1],
        })
    }

    /// Best-effort memory release: prune expired cache entries, let the
    /// allocator settle, measure the difference.
    ///
    /// Never fails. When the probe cannot produce before/after readings the
    /// outcome reports `success: false` and zero bytes, but cache pruning
    /// still happened.
    pub async fn reclaim(&self) -> ReclaimOutcome {
        let before = self.sample();
        let mut actions = Vec::new();

        let caches: Vec<Arc<dyn ReclaimableCache>> = lock_recovering(&self.caches).clone();
        if caches.is_empty() {
            actions.push("no caches registered".to_string());
        }
        for cache in caches {
            let evicted = cache.evict_expired(self.cache_ttl);
            debug!(cache = cache.name(), evicted, "pruned expired cache entries");
            actions.push(format!(
                "cache {}: evicted {} expired entries",
                cache.name(),
                evicted
            ));
        }

        tokio::time::sleep(self.reclaim_settle).await;
        let after = self.sample();

        let reclaimed_bytes = before.rss_bytes.saturating_sub(after.rss_bytes);
        if before.probe_ok && after.probe_ok {
            actions.push(format!("rss {} -> {} bytes", before.rss_bytes, after.rss_bytes));
            ReclaimOutcome {
                success: true,
                reclaimed_bytes,
                actions,
                message: None,
            }
        } else {
            ReclaimOutcome {
                success: false,
                reclaimed_bytes: 0,
                actions,
                message: Some("memory counters unavailable; reclaimed bytes unknown".to_string()),
            }
        }
    }

    /// Last classified sample, if any has been taken.
    pub fn last_status(&self) -> Option<MemoryStatus> {
        lock_recovering(&self.state).last.clone()
    }

    /// Counters for the stats surface.
    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = lock_recovering(&self.state);
        MonitorSnapshot {
            last: state.last.clone(),
            peak_used_percent: state.peak_used_percent,
            peak_rss_bytes: state.peak_rss_bytes,
            pressure_for: state.pressure_onset.map(|t| t.elapsed()),
            consecutive_probe_failures: state.consecutive_probe_failures,
        }
    }
}

/// Locks a mutex, recovering from poisoning.
///
/// Monitor state is plain counters; a panic mid-update cannot leave it
/// unusable, and the monitor must keep answering either way.
fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
