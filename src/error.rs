//! Error types for the pulpmill job engine.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`EngineError`] — **Fatal**: the engine cannot start or the call cannot
//!   be serviced at all (invalid configuration, engine already shut down).
//!   Returned as `Err(EngineError)` from [`crate::engine::Engine`] entry
//!   points.
//!
//! * [`JobError`] — **Per-job**: one job's attempt failed (converter fault,
//!   upload failure, deadline expiry) while the engine and every other job
//!   keep running. Stored on the job record and surfaced verbatim through
//!   [`crate::engine::JobStatus::Failed`] once attempts are exhausted.
//!
//! Memory pressure is deliberately absent from both: pressure is a signal
//! that reshapes scheduling, never an error.
//!
//! The scheduler consults [`JobError::is_retryable`] before re-queueing.
//! Transient collaborator failures retry with a priority boost; structural
//! failures (a chunk plan whose results do not cover the plan) fail the job
//! immediately, because retrying cannot repair them.

use thiserror::Error;

/// All fatal errors returned by the pulpmill engine surface.
///
/// Job-level failures use [`JobError`] and are stored on job records rather
/// than propagated here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Builder or startup validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The engine has been shut down; no further submissions are accepted.
    #[error("Engine is shut down; call rejected")]
    Shutdown,
}

/// A failure of one job attempt.
///
/// Cheap to clone and serialisable so it can ride inside status reports and
/// the failed-job log. The variant decides retry policy: see
/// [`JobError::is_retryable`].
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum JobError {
    // ── Transient failures (retry with boosted priority) ──────────────────
    /// The source document could not be fetched from the artifact store.
    #[error("Failed to fetch source '{location}': {detail}")]
    Fetch { location: String, detail: String },

    /// Page counting or page-range extraction failed.
    #[error("Pagination failed: {detail}")]
    Paging { detail: String },

    /// The converter rejected or failed the conversion call.
    #[error("Conversion failed ({source_format} -> {target_format}): {detail}")]
    Conversion {
        source_format: String,
        target_format: String,
        detail: String,
    },

    /// Upload failed after exhausting its bounded retries.
    #[error("Upload failed after {attempts} attempts: {detail}")]
    Upload { attempts: u32, detail: String },

    /// The attempt outran the configured per-job deadline.
    #[error("Job exceeded its deadline of {limit_ms}ms")]
    DeadlineExceeded { limit_ms: u64 },

    // ── Structural failures (never retried) ───────────────────────────────
    /// Chunk results do not line up with the chunk plan.
    ///
    /// Indicates a bug or data corruption between plan and execution, not a
    /// transient fault: a missing or duplicated chunk index means re-running
    /// the same plan would mis-assemble again, so the job fails immediately.
    #[error("Chunk assembly inconsistency: {detail}")]
    Assembly { detail: String },

    /// Unexpected internal error (including a panicking job runner).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Whether the scheduler may re-queue the job after this failure.
    ///
    /// Collaborator faults and deadline expiries are assumed transient.
    /// Assembly inconsistencies and internal faults are structural and go
    /// terminal on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, JobError::Assembly { .. } | JobError::Internal(_))
    }
}
