//! The engine facade: one handle over the queue, the memory monitor, and
//! the scheduler driver.
//!
//! [`Engine::start`] validates the config, spawns the two background tasks
//! (the dispatch driver and the memory sampler), and returns a handle the
//! host keeps for the life of the process. All methods take `&self`, so the
//! handle shares cleanly behind an `Arc` in a web backend's application
//! state.
//!
//! The sampler is the feedback loop: every interval it takes one memory
//! sample, feeds the classification to the queue (which throttles or pauses
//! itself), and on the transition into critical pressure kicks off a cache
//! reclamation pass.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chunk::ChunkSummary;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, JobEvent};
use crate::executor::ConversionExecutor;
use crate::external::{ServiceSet, StoredArtifact};
use crate::job::{JobId, JobPayload, JobRunner, SubmitOptions};
use crate::memory::{
    MemoryMonitor, MemoryPressure, MemoryProbe, MonitorSnapshot, ReclaimOutcome,
    ReclaimableCache, TrendAssessment,
};
use crate::queue::{JobQueue, JobView, QueueStats};
use crate::scheduler::Scheduler;

/// Externally visible state of a job, as returned by [`Engine::job_status`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to dispatch; `position` counts the jobs ahead of it.
    Queued { position: usize, attempts: u32 },
    /// Running right now.
    Processing { percent: u8, attempt: u32 },
    Completed {
        artifact: StoredArtifact,
        attempts: u32,
        chunks: Option<ChunkSummary>,
    },
    /// Out of attempts or failed structurally; `error` is the last
    /// attempt's message, verbatim.
    Failed { error: String, attempts: u32 },
}

/// Handle over a running job engine.
pub struct Engine {
    config: EngineConfig,
    queue: Arc<JobQueue>,
    monitor: Arc<MemoryMonitor>,
    executor: Arc<ConversionExecutor>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Validates the config and starts the engine.
    ///
    /// Must be called from within a Tokio runtime; the driver and sampler
    /// are spawned onto it.
    pub fn start(config: EngineConfig, services: ServiceSet) -> Result<Engine, EngineError> {
        config.validate()?;
        let monitor = Arc::new(MemoryMonitor::new(&config));
        Ok(Self::assemble(config, services, monitor))
    }

    /// Like [`start`](Self::start), but memory is read through the given
    /// probe instead of the process/system defaults. For hosts that should
    /// watch a cgroup limit rather than the whole machine, and for tests.
    pub fn start_with_probe(
        config: EngineConfig,
        services: ServiceSet,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Engine, EngineError> {
        config.validate()?;
        let monitor = Arc::new(MemoryMonitor::with_probe(&config, probe));
        Ok(Self::assemble(config, services, monitor))
    }

    fn assemble(config: EngineConfig, services: ServiceSet, monitor: Arc<MemoryMonitor>) -> Engine {
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(JobQueue::new(&config));
        let executor = Arc::new(ConversionExecutor::new(
            &config,
            services.clone(),
            Arc::clone(&monitor),
        ));
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&services.sink),
            Arc::clone(&events),
            &config,
            cancel.clone(),
        );
        let driver = tokio::spawn(scheduler.run());
        let sampler = tokio::spawn(sampler_loop(
            Arc::clone(&monitor),
            Arc::clone(&queue),
            Arc::clone(&events),
            Duration::from_millis(config.sample_interval_ms),
            cancel.clone(),
        ));

        info!(
            concurrency = config.concurrency,
            max_attempts = config.max_attempts,
            sample_interval_ms = config.sample_interval_ms,
            "job engine started"
        );
        Engine {
            config,
            queue,
            monitor,
            executor,
            events,
            cancel,
            driver: Mutex::new(Some(driver)),
            sampler: Mutex::new(Some(sampler)),
        }
    }

    /// Submits a conversion job; returns its id immediately.
    pub async fn submit(&self, payload: JobPayload, priority: i32) -> Result<JobId, EngineError> {
        self.submit_with(payload, priority, SubmitOptions::default())
            .await
    }

    /// Submits a conversion job with per-job options.
    pub async fn submit_with(
        &self,
        payload: JobPayload,
        priority: i32,
        options: SubmitOptions,
    ) -> Result<JobId, EngineError> {
        let runner = Arc::clone(&self.executor) as Arc<dyn JobRunner>;
        self.submit_runner(payload, priority, options, runner).await
    }

    /// Submits a job with a caller-provided runner instead of the built-in
    /// conversion executor. The job still gets the full scheduling
    /// treatment: priority, retries, memory throttling.
    pub async fn submit_runner(
        &self,
        payload: JobPayload,
        priority: i32,
        options: SubmitOptions,
        runner: Arc<dyn JobRunner>,
    ) -> Result<JobId, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let id = self.queue.submit(payload, priority, options, runner).await;
        self.events.emit(JobEvent::Submitted {
            id: id.clone(),
            priority,
        });
        Ok(id)
    }

    /// Where the job is now, or `None` if the id is unknown (never
    /// submitted, or its terminal record has aged out of retention).
    pub async fn job_status(&self, id: &JobId) -> Option<JobStatus> {
        Some(match self.queue.find(id).await? {
            JobView::Queued {
                position, attempts, ..
            } => JobStatus::Queued { position, attempts },
            JobView::Active { percent, attempt } => JobStatus::Processing { percent, attempt },
            JobView::Completed(record) => JobStatus::Completed {
                artifact: record.outcome.artifact,
                attempts: record.attempts,
                chunks: record.outcome.chunks,
            },
            JobView::Failed(record) => JobStatus::Failed {
                error: record.error.to_string(),
                attempts: record.attempts,
            },
        })
    }

    /// Queue counters plus the latest memory classification.
    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Stops dispatching new jobs; running jobs finish normally.
    pub async fn pause(&self) {
        self.queue.pause().await;
    }

    /// Resumes dispatching after [`pause`](Self::pause). Has no effect on a
    /// pause imposed by memory pressure; that clears when pressure does.
    pub async fn resume(&self) {
        self.queue.resume().await;
    }

    /// Runs a reclamation pass right now, regardless of pressure.
    pub async fn force_reclaim(&self) -> ReclaimOutcome {
        self.monitor.reclaim().await
    }

    /// Registers a host cache for TTL pruning during reclamation.
    pub fn register_cache(&self, cache: Arc<dyn ReclaimableCache>) {
        self.monitor.register_cache(cache);
    }

    /// Monitor counters: peak usage, probe health, pressure duration.
    pub fn memory_snapshot(&self) -> MonitorSnapshot {
        self.monitor.snapshot()
    }

    /// Usage trend over the recent sample history.
    pub fn memory_trend(&self) -> TrendAssessment {
        self.monitor.detect_trend()
    }

    /// A live stream of [`JobEvent`]s. Each call returns an independent
    /// subscription starting from now.
    pub fn subscribe(&self) -> BroadcastStream<JobEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stops both background tasks and waits for them to exit.
    ///
    /// Queued jobs stay queued and are lost with the process; attempts
    /// already running are detached. Idempotent; further submissions are
    /// rejected with [`EngineError::Shutdown`].
    pub async fn shutdown(&self) {
        info!("job engine shutting down");
        self.cancel.cancel();
        let driver = take_handle(&self.driver);
        let sampler = take_handle(&self.sampler);
        if let Some(handle) = driver {
            let _ = handle.await;
        }
        if let Some(handle) = sampler {
            let _ = handle.await;
        }
    }
}

fn take_handle(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
}

/// Periodic sample-classify-signal loop.
async fn sampler_loop(
    monitor: Arc<MemoryMonitor>,
    queue: Arc<JobQueue>,
    events: Arc<EventBus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_pressure: Option<MemoryPressure> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let status = monitor.sample();
        let entered_critical = match last_pressure {
            Some(prev) if prev != status.pressure => {
                info!(
                    from = prev.as_str(),
                    to = status.pressure.as_str(),
                    used_percent = status.used_percent,
                    "memory pressure changed"
                );
                events.emit(JobEvent::PressureChanged {
                    from: prev,
                    to: status.pressure,
                    used_percent: status.used_percent,
                });
                prev < MemoryPressure::Critical && status.pressure >= MemoryPressure::Critical
            }
            None => status.pressure >= MemoryPressure::Critical,
            _ => false,
        };
        last_pressure = Some(status.pressure);

        // Throttle or pause the queue first; reclaiming can take a moment.
        queue.on_memory_signal(&status).await;

        if entered_critical {
            let outcome = monitor.reclaim().await;
            info!(
                success = outcome.success,
                reclaimed_bytes = outcome.reclaimed_bytes,
                actions = outcome.actions.len(),
                "reclamation pass after entering critical pressure"
            );
        }
    }
}
