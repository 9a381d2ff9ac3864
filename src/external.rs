//! Interfaces the engine consumes from the host backend.
//!
//! The engine never parses documents, renders pages, or talks to storage or
//! clients itself. The host hands it four collaborators:
//!
//! * [`Converter`] — performs the actual format conversion.
//! * [`DocumentPager`] — counts pages and extracts page ranges.
//! * [`ArtifactStore`] — fetches sources, persists outputs, bundles chunks.
//! * [`StatusSink`] — receives progress and terminal status reports.
//!
//! All traits are object-safe and `Send + Sync`; the engine holds them as
//! `Arc<dyn ...>` and calls them concurrently. Implementations doing
//! CPU-heavy work (rasterisation, archive packing) should offload to
//! `tokio::task::spawn_blocking` internally.
//!
//! Document and artifact payloads travel as [`Bytes`] so hand-off between
//! tasks is a reference-count bump, not a copy.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::PageRange;
use crate::job::{DocumentFormat, JobId};

/// Failure reported by a host-provided service.
///
/// The engine treats every external failure as transient; retry policy is
/// applied at the job level, not here.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ExternalError(String);

impl ExternalError {
    pub fn new(message: impl Into<String>) -> Self {
        ExternalError(message.into())
    }
}

impl From<String> for ExternalError {
    fn from(message: String) -> Self {
        ExternalError(message)
    }
}

impl From<&str> for ExternalError {
    fn from(message: &str) -> Self {
        ExternalError(message.to_string())
    }
}

/// Converts a document (or a page-range slice of one) between formats.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        input: Bytes,
        source: DocumentFormat,
        target: DocumentFormat,
        options: &serde_json::Value,
    ) -> Result<Bytes, ExternalError>;
}

/// Page-level access to a source document.
#[async_trait]
pub trait DocumentPager: Send + Sync {
    async fn page_count(&self, document: &Bytes) -> Result<u32, ExternalError>;

    /// Extracts the pages in `range` (0-based, end-inclusive) as a
    /// standalone document of the same format.
    async fn extract_pages(&self, document: &Bytes, range: PageRange)
        -> Result<Bytes, ExternalError>;
}

/// Identity an artifact is stored under.
///
/// The key is deterministic per (job, chunk): re-uploading with the same
/// metadata overwrites, which is what makes crashed attempts safe to re-run.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMeta {
    pub job_id: JobId,
    /// Set for per-chunk artifacts; `None` for whole-document outputs.
    pub chunk_index: Option<u32>,
    pub format: DocumentFormat,
}

impl ArtifactMeta {
    pub fn whole(job_id: JobId, format: DocumentFormat) -> Self {
        ArtifactMeta {
            job_id,
            chunk_index: None,
            format,
        }
    }

    pub fn chunk(job_id: JobId, index: u32, format: DocumentFormat) -> Self {
        ArtifactMeta {
            job_id,
            chunk_index: Some(index),
            format,
        }
    }

    /// Deterministic storage key for this artifact.
    pub fn storage_key(&self) -> String {
        match self.chunk_index {
            Some(i) => format!("{}/chunk-{:04}.{}", self.job_id, i, self.format.as_str()),
            None => format!("{}/result.{}", self.job_id, self.format.as_str()),
        }
    }
}

/// Receipt for a persisted artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub location: String,
    pub size_bytes: u64,
}

/// Fetches sources and persists conversion outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Bytes, ExternalError>;

    /// Persists `data` under the deterministic key for `meta`, overwriting
    /// any previous upload with the same metadata.
    async fn upload(&self, data: Bytes, meta: &ArtifactMeta) -> Result<StoredArtifact, ExternalError>;

    /// Packages the referenced artifacts into a single archive.
    async fn bundle(
        &self,
        locations: &[String],
        meta: &ArtifactMeta,
    ) -> Result<StoredArtifact, ExternalError>;
}

/// Terminal state of a job as reported to the sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed { artifact: StoredArtifact },
    Failed { error: String },
}

/// Receives job status updates.
///
/// Reports are fire-and-forget: the engine does not retry or react to sink
/// behaviour, so implementations should log their own delivery failures.
/// All methods default to no-ops; implement only what the host surfaces.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report_progress(&self, job: &JobId, percent: u8) {
        let _ = (job, percent);
    }

    async fn report_terminal(&self, job: &JobId, status: &TerminalStatus) {
        let _ = (job, status);
    }
}

/// Sink that silently discards all reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {}

/// The full set of host collaborators handed to [`crate::engine::Engine`].
#[derive(Clone)]
pub struct ServiceSet {
    pub converter: Arc<dyn Converter>,
    pub pager: Arc<dyn DocumentPager>,
    pub store: Arc<dyn ArtifactStore>,
    pub sink: Arc<dyn StatusSink>,
}

impl ServiceSet {
    /// Bundles the three required services; status reporting defaults to
    /// [`NoopStatusSink`].
    pub fn new(
        converter: Arc<dyn Converter>,
        pager: Arc<dyn DocumentPager>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        ServiceSet {
            converter,
            pager,
            store,
            sink: Arc::new(NoopStatusSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSet")
            .field("converter", &"<dyn Converter>")
            .field("pager", &"<dyn DocumentPager>")
            .field("store", &"<dyn ArtifactStore>")
            .field("sink", &"<dyn StatusSink>")
            .finish()
    }
}

/// Runs a store operation with bounded retries and exponential backoff.
///
/// Delays double per retry from `backoff_ms` (500 ms → 1 s → 2 s at the
/// defaults), so a struggling storage backend gets room to recover instead
/// of a synchronized hammering from every active job. Exhausted retries
/// surface as [`JobError::Upload`] carrying the last failure verbatim.
pub(crate) async fn retry_store_op<T, F, Fut>(
    op: &str,
    max_attempts: u32,
    backoff_ms: u64,
    mut call: F,
) -> Result<T, crate::error::JobError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExternalError>>,
{
    let mut last_error = String::from("no attempts made");
    for attempt in 1..=max_attempts.max(1) {
        if attempt > 1 {
            let delay = backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 2));
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!("{op} attempt {attempt}/{max_attempts} failed: {e}");
                last_error = e.to_string();
            }
        }
    }
    Err(crate::error::JobError::Upload {
        attempts: max_attempts.max(1),
        detail: last_error,
    })
}
