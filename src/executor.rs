//! The built-in conversion runner.
//!
//! One attempt is: fetch the source, count pages, decide whole-vs-chunked
//! against the current memory pressure, convert, deliver. Progress is
//! coarse on purpose: 10 as the attempt starts, then either 50
//! mid-conversion or an interpolated climb across chunks, and 90 once the
//! deliverable is staged. The scheduler reports 100 at completion.
//!
//! Every attempt is a clean re-run: artifacts are keyed by job id and
//! overwritten on upload, so a retry after a partial failure leaves no
//! stale output behind.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, instrument};

use crate::chunk::{ChunkPlanner, ChunkResult};
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::external::{retry_store_op, ArtifactMeta, ServiceSet};
use crate::job::{JobContext, JobOutcome, JobRunner, ProgressHandle};
use crate::memory::{MemoryMonitor, MemoryPressure};

/// Progress covered by chunk execution, between the initial report (10)
/// and combine (90).
fn chunk_progress(done: u32, total: u32) -> u8 {
    (10 + (done.min(total) * 75) / total.max(1)) as u8
}

/// [`JobRunner`] for document conversions. The engine wires one of these
/// as the runner for every submitted conversion job.
pub struct ConversionExecutor {
    services: ServiceSet,
    planner: ChunkPlanner,
    monitor: Arc<MemoryMonitor>,
    upload_retries: u32,
    retry_backoff_ms: u64,
    chunk_concurrency: usize,
}

impl ConversionExecutor {
    pub fn new(config: &EngineConfig, services: ServiceSet, monitor: Arc<MemoryMonitor>) -> Self {
        ConversionExecutor {
            planner: ChunkPlanner::new(config, services.clone()),
            services,
            monitor,
            upload_retries: config.upload_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            chunk_concurrency: config.chunk_concurrency.max(1),
        }
    }

    async fn convert_whole(
        &self,
        ctx: &JobContext,
        document: Bytes,
        progress: &ProgressHandle,
    ) -> Result<JobOutcome, JobError> {
        let payload = &ctx.payload;
        let converted = self
            .services
            .converter
            .convert(
                document,
                payload.source_format,
                payload.target_format,
                &payload.options,
            )
            .await
            .map_err(|e| JobError::Conversion {
                source_format: payload.source_format.to_string(),
                target_format: payload.target_format.to_string(),
                detail: e.to_string(),
            })?;
        progress.update(50);

        let meta = ArtifactMeta::whole(ctx.id.clone(), payload.target_format);
        let artifact = retry_store_op(
            "result upload",
            self.upload_retries,
            self.retry_backoff_ms,
            || self.services.store.upload(converted.clone(), &meta),
        )
        .await?;
        progress.update(90);

        info!(
            location = %artifact.location,
            bytes = artifact.size_bytes,
            "conversion delivered"
        );
        Ok(JobOutcome {
            artifact,
            chunks: None,
        })
    }

    async fn convert_chunked(
        &self,
        ctx: &JobContext,
        document: Bytes,
        page_count: u32,
        pressure: MemoryPressure,
        progress: &ProgressHandle,
    ) -> Result<JobOutcome, JobError> {
        let plan = self.planner.policy().plan(page_count, pressure);
        let total = plan.chunk_count();
        info!(
            pages = page_count,
            chunks = total,
            chunk_size = plan.chunk_size,
            pressure = pressure.as_str(),
            "running chunked conversion"
        );

        let mut results: Vec<ChunkResult> = Vec::with_capacity(total as usize);
        if self.chunk_concurrency <= 1 {
            for (index, range) in plan.ranges.iter().enumerate() {
                let result = self
                    .planner
                    .execute_chunk(ctx, &document, index as u32, *range)
                    .await?;
                results.push(result);
                progress.update(chunk_progress(results.len() as u32, total));
            }
        } else {
            let mut in_flight = stream::iter(plan.ranges.iter().copied().enumerate().map(
                |(index, range)| self.planner.execute_chunk(ctx, &document, index as u32, range),
            ))
            .buffer_unordered(self.chunk_concurrency);
            while let Some(result) = in_flight.next().await {
                results.push(result?);
                progress.update(chunk_progress(results.len() as u32, total));
            }
        }

        let combined = self.planner.combine(ctx, &plan, results).await?;
        progress.update(90);

        info!(
            location = %combined.artifact.location,
            chunks = combined.chunk_count,
            kind = ?combined.kind,
            "chunked conversion delivered"
        );
        let summary = combined.summary();
        Ok(JobOutcome {
            artifact: combined.artifact,
            chunks: Some(summary),
        })
    }
}

#[async_trait]
impl JobRunner for ConversionExecutor {
    #[instrument(
        skip(self, ctx, progress),
        fields(job = %ctx.id, correlation = %ctx.correlation_id, attempt = ctx.attempt)
    )]
    async fn run(
        &self,
        ctx: JobContext,
        progress: ProgressHandle,
    ) -> Result<JobOutcome, JobError> {
        let payload = &ctx.payload;
        debug!(
            source = %payload.source_location,
            from = %payload.source_format,
            to = %payload.target_format,
            "attempt started"
        );
        progress.update(10);

        let document = self
            .services
            .store
            .fetch(&payload.source_location)
            .await
            .map_err(|e| JobError::Fetch {
                location: payload.source_location.clone(),
                detail: e.to_string(),
            })?;

        let page_count = self
            .services
            .pager
            .page_count(&document)
            .await
            .map_err(|e| JobError::Paging {
                detail: e.to_string(),
            })?;

        // Use the sampler's view of pressure; take our own sample only if
        // it has not run yet.
        let pressure = match self.monitor.last_status() {
            Some(status) => status.pressure,
            None => self.monitor.sample().pressure,
        };

        let size_bytes = document.len() as u64;
        if self
            .planner
            .policy()
            .should_chunk(size_bytes, page_count, payload.target_format, pressure)
        {
            self.convert_chunked(&ctx, document, page_count, pressure, &progress)
                .await
        } else {
            debug!(
                pages = page_count,
                bytes = size_bytes,
                "converting whole document"
            );
            self.convert_whole(&ctx, document, &progress).await
        }
    }
}
