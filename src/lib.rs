//! # pulpmill
//!
//! Memory-aware background job engine for PDF conversion backends.
//!
//! ## Why this crate?
//!
//! Document conversion is bursty and memory-hungry: a handful of 200-page
//! uploads can take a web backend from comfortable to OOM-killed in
//! seconds. Running conversions inline with requests makes the API's tail
//! latency hostage to the slowest document. This crate moves conversion
//! into a background engine that queues by priority, caps concurrency,
//! watches process memory, and splits oversized documents into page-range
//! chunks so no single job holds a whole decoded document at once.
//!
//! The engine does no document work itself. The host supplies the
//! converter, the page extractor, and the artifact store as trait objects;
//! the engine supplies scheduling, retry, backpressure, and assembly.
//!
//! ## Pipeline Overview
//!
//! ```text
//! submit(payload, priority)
//!  │
//!  ├─ 1. Queue     priority heap, FIFO within a level, retries boosted
//!  ├─ 2. Dispatch  only while active < limit and intake is not paused
//!  ├─ 3. Execute   fetch → whole conversion, or plan → chunks → combine
//!  ├─ 4. Deliver   keyed uploads with retry; merge or bundle chunk output
//!  └─ 5. Report    progress + terminal status, events, bounded result logs
//!
//! (memory sampler ──signals──▶ queue: throttle / pause / restore)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulpmill::{DocumentFormat, Engine, EngineConfig, JobPayload, ServiceSet};
//!
//! # async fn example(services: ServiceSet) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::builder()
//!     .concurrency(4)
//!     .max_attempts(3)
//!     .build()?;
//! let engine = Engine::start(config, services)?;
//!
//! let payload = JobPayload::new(
//!     "inbox/report.pdf",
//!     DocumentFormat::Pdf,
//!     DocumentFormat::Markdown,
//! );
//! let id = engine.submit(payload, 0).await?;
//!
//! if let Some(status) = engine.job_status(&id).await {
//!     println!("{status:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Memory feedback at a glance
//!
//! | Pressure | Threshold (default) | Scheduler reaction |
//! |-----------|--------------------|--------------------|
//! | ok        | < 65 %             | restore limit one step per signal |
//! | warning   | ≥ 65 %             | restore limit one step per signal |
//! | critical  | ≥ 80 %             | halve the limit (floor 1), chunk harder, reclaim caches |
//! | emergency | ≥ 90 %             | pause intake, single-page chunks |
//!
//! Running jobs are never killed by pressure; the engine stops starting
//! new work instead.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod external;
pub mod job;
pub mod memory;
pub mod queue;

mod scheduler;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use chunk::{ChunkPlan, ChunkPolicy, ChunkSummary, CombinedKind, PageRange};
pub use config::{EngineConfig, EngineConfigBuilder, MonitorFailurePolicy, PressureThresholds};
pub use engine::{Engine, JobStatus};
pub use error::{EngineError, JobError};
pub use events::JobEvent;
pub use executor::ConversionExecutor;
pub use external::{
    ArtifactMeta, ArtifactStore, Converter, DocumentPager, ExternalError, NoopStatusSink,
    ServiceSet, StatusSink, StoredArtifact, TerminalStatus,
};
pub use job::{
    DocumentFormat, JobContext, JobId, JobOutcome, JobPayload, JobRunner, ProgressHandle,
    SubmitOptions,
};
pub use memory::{
    MemoryCounters, MemoryMonitor, MemoryPressure, MemoryProbe, MemoryStatus, MemoryTrend,
    MonitorSnapshot, ProbeError, ReclaimOutcome, ReclaimableCache, TrendAssessment,
};
pub use queue::QueueStats;
