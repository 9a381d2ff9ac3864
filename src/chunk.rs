//! Chunked conversion: deciding, planning, executing, combining.
//!
//! Large or memory-hungry conversions are split into contiguous page
//! ranges so no single attempt holds the whole decoded document. The
//! split is planned up front ([`ChunkPolicy`]), executed one range at a
//! time ([`ChunkPlanner::execute_chunk`] — extract, convert, upload, drop),
//! and reassembled at the end ([`ChunkPlanner::combine`]).
//!
//! ## Why assembly fails loudly
//!
//! `combine` re-orders chunk results by index, so chunks may finish in any
//! order. What it will not do is paper over a hole: a missing or duplicated
//! index means the plan and its results disagree, and retrying the same
//! plan would mis-assemble the same way. That case returns
//! [`JobError::Assembly`], which the scheduler treats as terminal.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::JobError;
use crate::external::{retry_store_op, ArtifactMeta, ServiceSet, StoredArtifact};
use crate::job::{DocumentFormat, JobContext};
use crate::memory::MemoryPressure;

/// A contiguous page range, 0-based and end-inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        PageRange { start, end }
    }

    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pages {}-{}", self.start, self.end)
    }
}

/// The agreed split for one conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkPlan {
    /// Contiguous, non-overlapping, covering `0..total_pages` exactly.
    pub ranges: Vec<PageRange>,
    /// Pages per chunk the plan was built with (the final range may be
    /// shorter).
    pub chunk_size: u32,
    /// Pressure level that shaped the plan.
    pub pressure: MemoryPressure,
    pub total_pages: u32,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> u32 {
        self.ranges.len() as u32
    }
}

/// One executed chunk.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    pub index: u32,
    pub range: PageRange,
    pub artifact: StoredArtifact,
}

/// How chunk artifacts became one deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinedKind {
    /// Chunk artifacts concatenated into a single artifact.
    Merged,
    /// Chunk artifacts packaged into an archive referencing each one.
    Bundled,
}

/// The assembled deliverable of a chunked conversion.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedResult {
    pub artifact: StoredArtifact,
    pub kind: CombinedKind,
    pub chunk_count: u32,
    /// Total bytes across the chunk artifacts that went in.
    pub chunk_bytes: u64,
}

impl CombinedResult {
    pub fn summary(&self) -> ChunkSummary {
        ChunkSummary {
            chunk_count: self.chunk_count,
            kind: self.kind,
        }
    }
}

/// Compact record of a chunked run, carried on the job outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_count: u32,
    pub kind: CombinedKind,
}

// ── Policy ───────────────────────────────────────────────────────────────

/// Pure chunking decisions; no I/O.
#[derive(Debug, Clone)]
pub struct ChunkPolicy {
    min_chunkable_pages: u32,
    default_chunk_size: u32,
    large_document_bytes: u64,
}

impl ChunkPolicy {
    pub fn new(config: &EngineConfig) -> Self {
        ChunkPolicy {
            min_chunkable_pages: config.min_chunkable_pages,
            default_chunk_size: config.default_chunk_size,
            large_document_bytes: config.large_document_bytes,
        }
    }

    /// Whether this conversion should run chunked.
    ///
    /// Requires the page count to exceed the chunkable minimum, then any
    /// one trigger suffices: a large source, a memory-intensive target
    /// format, or critical-or-worse pressure (pressure alone forces
    /// chunking even for small, cheap documents).
    pub fn should_chunk(
        &self,
        size_bytes: u64,
        page_count: u32,
        target: DocumentFormat,
        pressure: MemoryPressure,
    ) -> bool {
        if page_count <= 1 || page_count <= self.min_chunkable_pages {
            return false;
        }
        size_bytes > self.large_document_bytes
            || target.is_memory_intensive()
            || pressure >= MemoryPressure::Critical
    }

    /// Pages per chunk under the given pressure: the configured default,
    /// halved (floor, minimum 1) under critical, single pages under
    /// emergency.
    pub fn chunk_size_for(&self, pressure: MemoryPressure) -> u32 {
        match pressure {
            MemoryPressure::Emergency => 1,
            MemoryPressure::Critical => (self.default_chunk_size / 2).max(1),
            MemoryPressure::Ok | MemoryPressure::Warning => self.default_chunk_size,
        }
    }

    /// Builds the covering range list for `total_pages`.
    pub fn plan(&self, total_pages: u32, pressure: MemoryPressure) -> ChunkPlan {
        let chunk_size = self.chunk_size_for(pressure);
        let mut ranges = Vec::with_capacity(total_pages.div_ceil(chunk_size) as usize);
        let mut start = 0;
        while start < total_pages {
            let end = (start + chunk_size).min(total_pages) - 1;
            ranges.push(PageRange::new(start, end));
            start = end + 1;
        }
        ChunkPlan {
            ranges,
            chunk_size,
            pressure,
            total_pages,
        }
    }
}

// ── Assembly ─────────────────────────────────────────────────────────────

/// Sorts chunk results by index and verifies they cover the plan exactly.
pub(crate) fn order_results(
    mut results: Vec<ChunkResult>,
    expected: u32,
) -> Result<Vec<ChunkResult>, JobError> {
    results.sort_by_key(|r| r.index);

    if results.len() != expected as usize {
        let present: Vec<u32> = results.iter().map(|r| r.index).collect();
        let missing: Vec<u32> = (0..expected).filter(|i| !present.contains(i)).collect();
        return Err(JobError::Assembly {
            detail: format!(
                "plan expects {expected} chunks, got {}; missing indexes {missing:?}",
                results.len()
            ),
        });
    }
    for (position, result) in results.iter().enumerate() {
        if result.index != position as u32 {
            return Err(JobError::Assembly {
                detail: format!(
                    "chunk sequence broken at position {position}: found index {}",
                    result.index
                ),
            });
        }
    }
    Ok(results)
}

// ── Planner ──────────────────────────────────────────────────────────────

/// Executes and reassembles chunked conversions against the host services.
pub struct ChunkPlanner {
    policy: ChunkPolicy,
    services: ServiceSet,
    upload_retries: u32,
    retry_backoff_ms: u64,
}

impl ChunkPlanner {
    pub fn new(config: &EngineConfig, services: ServiceSet) -> Self {
        ChunkPlanner {
            policy: ChunkPolicy::new(config),
            services,
            upload_retries: config.upload_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    /// Runs one chunk: extract the range, convert it, upload the artifact.
    ///
    /// The extracted sub-document is consumed by the conversion and the
    /// converted bytes by the upload, so nothing from this chunk outlives
    /// the call except the returned artifact reference.
    pub async fn execute_chunk(
        &self,
        ctx: &JobContext,
        document: &Bytes,
        index: u32,
        range: PageRange,
    ) -> Result<ChunkResult, JobError> {
        let payload = &ctx.payload;
        let slice = self
            .services
            .pager
            .extract_pages(document, range)
            .await
            .map_err(|e| JobError::Paging {
                detail: format!("chunk {index} ({range}): {e}"),
            })?;

        let converted = self
            .services
            .converter
            .convert(slice, payload.source_format, payload.target_format, &payload.options)
            .await
            .map_err(|e| JobError::Conversion {
                source_format: payload.source_format.to_string(),
                target_format: payload.target_format.to_string(),
                detail: format!("chunk {index} ({range}): {e}"),
            })?;

        let meta = ArtifactMeta::chunk(ctx.id.clone(), index, payload.target_format);
        let artifact = retry_store_op(
            "chunk upload",
            self.upload_retries,
            self.retry_backoff_ms,
            || self.services.store.upload(converted.clone(), &meta),
        )
        .await?;

        debug!(
            job = %ctx.id,
            index,
            %range,
            bytes = artifact.size_bytes,
            "chunk converted and uploaded"
        );
        Ok(ChunkResult {
            index,
            range,
            artifact,
        })
    }

    /// Assembles chunk results into the final deliverable.
    ///
    /// Results may arrive in any order. A single-chunk plan is promoted to
    /// a plain whole-document artifact so it is indistinguishable from an
    /// unchunked conversion.
    pub async fn combine(
        &self,
        ctx: &JobContext,
        plan: &ChunkPlan,
        results: Vec<ChunkResult>,
    ) -> Result<CombinedResult, JobError> {
        let ordered = order_results(results, plan.chunk_count())?;
        let chunk_bytes: u64 = ordered.iter().map(|r| r.artifact.size_bytes).sum();
        let target = ctx.payload.target_format;
        let meta = ArtifactMeta::whole(ctx.id.clone(), target);

        let (artifact, kind) = if ordered.len() == 1 || target.supports_concatenation() {
            let mut merged = BytesMut::with_capacity(chunk_bytes as usize);
            for result in &ordered {
                let data = self
                    .services
                    .store
                    .fetch(&result.artifact.location)
                    .await
                    .map_err(|e| JobError::Fetch {
                        location: result.artifact.location.clone(),
                        detail: format!("chunk {} readback: {e}", result.index),
                    })?;
                merged.extend_from_slice(&data);
            }
            let artifact = retry_store_op(
                "merged upload",
                self.upload_retries,
                self.retry_backoff_ms,
                || self.services.store.upload(merged.clone().freeze(), &meta),
            )
            .await?;
            (artifact, CombinedKind::Merged)
        } else {
            let locations: Vec<String> =
                ordered.iter().map(|r| r.artifact.location.clone()).collect();
            let artifact = retry_store_op(
                "bundle",
                self.upload_retries,
                self.retry_backoff_ms,
                || self.services.store.bundle(&locations, &meta),
            )
            .await?;
            (artifact, CombinedKind::Bundled)
        };

        debug!(
            job = %ctx.id,
            chunks = ordered.len(),
            kind = ?kind,
            bytes = artifact.size_bytes,
            "chunks combined"
        );
        Ok(CombinedResult {
            artifact,
            kind,
            chunk_count: ordered.len() as u32,
            chunk_bytes,
        })
    }
}
