//! Job model: identity, payload, the runner seam, and outcome types.
//!
//! A [`Job`] is the unit the queue schedules. It carries its own
//! [`JobRunner`] so heterogeneous work can share one queue: the engine
//! submits conversion jobs wired to the built-in executor, while tests and
//! embedders may submit custom runners.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chunk::ChunkSummary;
use crate::error::JobError;
use crate::external::StoredArtifact;

/// Unique job identifier.
///
/// Caller-supplied at submission or generated as a UUID v4. Doubles as the
/// default correlation id when the caller does not provide one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        JobId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

/// Document formats the conversion service moves between.
///
/// The engine never parses these itself; the enum exists so scheduling can
/// reason about memory cost and assembly strategy without consulting the
/// converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Txt,
    Markdown,
    Html,
    Docx,
    Xlsx,
    Png,
    Jpeg,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Txt => "txt",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Html => "html",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Xlsx => "xlsx",
            DocumentFormat::Png => "png",
            DocumentFormat::Jpeg => "jpeg",
        }
    }

    /// Formats whose conversion holds large intermediate state (rasterised
    /// pages, office layout trees). These chunk even when the source file
    /// itself is small.
    pub fn is_memory_intensive(&self) -> bool {
        matches!(
            self,
            DocumentFormat::Png | DocumentFormat::Jpeg | DocumentFormat::Docx | DocumentFormat::Xlsx
        )
    }

    /// Formats where chunk artifacts can be merged by straight
    /// concatenation. Everything else gets bundled into an archive.
    pub fn supports_concatenation(&self) -> bool {
        matches!(self, DocumentFormat::Txt | DocumentFormat::Markdown)
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job converts: where the source lives and what to turn it into.
///
/// `options` is an opaque JSON document forwarded to the converter
/// untouched (DPI, quality, page orientation — whatever the converter
/// understands).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    /// Location of the source document in the artifact store.
    pub source_location: String,
    pub source_format: DocumentFormat,
    pub target_format: DocumentFormat,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl JobPayload {
    pub fn new(
        source_location: impl Into<String>,
        source_format: DocumentFormat,
        target_format: DocumentFormat,
    ) -> Self {
        JobPayload {
            source_location: source_location.into(),
            source_format,
            target_format,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Per-submission knobs beyond payload and priority.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Caller-supplied id; generated when `None`.
    pub id: Option<JobId>,
    /// Correlation id threaded through every log line and status report for
    /// this job; defaults to the job id.
    pub correlation_id: Option<String>,
    /// Overrides the engine-wide attempt budget for this job.
    pub max_attempts: Option<u32>,
}

/// Everything a runner needs to execute one attempt.
///
/// Cloned out of the scheduler's bookkeeping before the runner starts so no
/// queue lock is held across execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: JobId,
    pub correlation_id: String,
    pub payload: JobPayload,
    /// 1-based attempt number for this run.
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i32,
}

/// A progress report on its way back to the scheduler.
pub(crate) struct ProgressUpdate {
    pub id: JobId,
    pub percent: u8,
}

/// Fire-and-forget progress reporting for one running attempt.
///
/// Bound to a single job id and backed by the scheduler's progress channel.
/// Updates are best-effort: after shutdown they go nowhere, and a runner
/// must never block on or fail because of progress.
#[derive(Clone)]
pub struct ProgressHandle {
    id: JobId,
    tx: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

impl ProgressHandle {
    pub(crate) fn new(id: JobId, tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        ProgressHandle { id, tx: Some(tx) }
    }

    /// A handle that drops every update. For calling runners directly,
    /// outside a scheduler.
    pub fn detached(id: JobId) -> Self {
        ProgressHandle { id, tx: None }
    }

    pub fn job_id(&self) -> &JobId {
        &self.id
    }

    pub fn update(&self, percent: u8) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressUpdate {
                id: self.id.clone(),
                percent: percent.min(100),
            });
        }
    }
}

impl fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProgressHandle").field(&self.id).finish()
    }
}

/// Successful result of a job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// The deliverable the poller ultimately receives.
    pub artifact: StoredArtifact,
    /// Present when the conversion ran chunked.
    pub chunks: Option<ChunkSummary>,
}

/// Executes one attempt of a job.
///
/// Implementations must be safe to call repeatedly with the same job id:
/// every attempt is a clean re-run and partial output from a previous
/// attempt may be overwritten.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, ctx: JobContext, progress: ProgressHandle)
        -> Result<JobOutcome, JobError>;
}

/// A schedulable job: payload plus queue bookkeeping plus its runner.
pub struct Job {
    pub id: JobId,
    pub correlation_id: String,
    pub payload: JobPayload,
    /// Higher runs first. Boosted on every retry so a struggling job does
    /// not starve behind a steady stream of fresh submissions.
    pub priority: i32,
    /// Completed attempts so far (0 until the first run finishes).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Monotonic submission stamp; breaks priority ties FIFO.
    pub(crate) sequence: u64,
    pub submitted_at: Instant,
    pub last_error: Option<JobError>,
    pub(crate) runner: Arc<dyn JobRunner>,
}

impl Job {
    /// Context for the next attempt of this job.
    pub(crate) fn context(&self) -> JobContext {
        JobContext {
            id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            payload: self.payload.clone(),
            attempt: self.attempts + 1,
            max_attempts: self.max_attempts,
            priority: self.priority,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("priority", &self.priority)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("sequence", &self.sequence)
            .field("last_error", &self.last_error)
            .field("runner", &"<dyn JobRunner>")
            .finish()
    }
}
