//! End-to-end integration tests for the pulpmill job engine.
//!
//! Everything here runs against in-memory mock services — no real
//! converter, page extractor, or storage backend — so the suite is fast
//! and deterministic enough for CI. Memory pressure is driven through a
//! dial-controlled probe rather than by actually allocating.
//!
//! Run with:
//!   cargo test --test engine -- --nocapture

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::StreamExt;

use pulpmill::{
    ArtifactMeta, ArtifactStore, Converter, DocumentFormat, DocumentPager, Engine, EngineConfig,
    ExternalError, JobContext, JobError, JobEvent, JobId, JobOutcome, JobPayload, JobRunner,
    JobStatus, MemoryCounters, MemoryProbe, PageRange, ProbeError, ProgressHandle,
    ReclaimableCache, ServiceSet, StatusSink, StoredArtifact, SubmitOptions, TerminalStatus,
};

// ── Test services ────────────────────────────────────────────────────────

/// Converter that tags its output and can be scripted to fail a few times
/// or to run slowly.
struct TagConverter {
    failures_left: AtomicU32,
    delay: Duration,
}

impl TagConverter {
    fn instant() -> Self {
        TagConverter {
            failures_left: AtomicU32::new(0),
            delay: Duration::ZERO,
        }
    }

    fn failing(times: u32) -> Self {
        TagConverter {
            failures_left: AtomicU32::new(times),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        TagConverter {
            failures_left: AtomicU32::new(0),
            delay,
        }
    }
}

#[async_trait]
impl Converter for TagConverter {
    async fn convert(
        &self,
        input: Bytes,
        _source: DocumentFormat,
        _target: DocumentFormat,
        _options: &serde_json::Value,
    ) -> Result<Bytes, ExternalError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ExternalError::new("converter overloaded"));
        }
        let mut out = b"md:".to_vec();
        out.extend_from_slice(&input);
        Ok(Bytes::from(out))
    }
}

/// Pager with a fixed page count; extracted ranges come back as readable
/// markers so merged output shows the assembly order.
struct MarkerPager {
    pages: u32,
}

#[async_trait]
impl DocumentPager for MarkerPager {
    async fn page_count(&self, _document: &Bytes) -> Result<u32, ExternalError> {
        Ok(self.pages)
    }

    async fn extract_pages(
        &self,
        _document: &Bytes,
        range: PageRange,
    ) -> Result<Bytes, ExternalError> {
        Ok(Bytes::from(format!("[{}..{}]", range.start, range.end)))
    }
}

/// In-memory artifact store that records the order of uploads.
struct SharedStore {
    objects: Mutex<HashMap<String, Bytes>>,
    upload_log: Mutex<Vec<String>>,
}

impl SharedStore {
    fn new() -> Arc<Self> {
        let store = SharedStore {
            objects: Mutex::new(HashMap::new()),
            upload_log: Mutex::new(Vec::new()),
        };
        store.seed("inbox/source.pdf", b"%PDF source bytes");
        Arc::new(store)
    }

    fn seed(&self, location: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(location.to_string(), Bytes::copy_from_slice(data));
    }

    fn get(&self, location: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(location).cloned()
    }

    fn uploads(&self) -> Vec<String> {
        self.upload_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactStore for SharedStore {
    async fn fetch(&self, location: &str) -> Result<Bytes, ExternalError> {
        self.get(location)
            .ok_or_else(|| ExternalError::new(format!("no object at {location}")))
    }

    async fn upload(&self, data: Bytes, meta: &ArtifactMeta) -> Result<StoredArtifact, ExternalError> {
        let key = meta.storage_key();
        let size = data.len() as u64;
        self.objects.lock().unwrap().insert(key.clone(), data);
        self.upload_log.lock().unwrap().push(key.clone());
        Ok(StoredArtifact {
            location: key,
            size_bytes: size,
        })
    }

    async fn bundle(
        &self,
        locations: &[String],
        meta: &ArtifactMeta,
    ) -> Result<StoredArtifact, ExternalError> {
        let key = meta.storage_key();
        let manifest = Bytes::from(locations.join("\n"));
        let size = manifest.len() as u64;
        self.objects.lock().unwrap().insert(key.clone(), manifest);
        self.upload_log.lock().unwrap().push(key.clone());
        Ok(StoredArtifact {
            location: key,
            size_bytes: size,
        })
    }
}

/// Sink that records every report it receives.
#[derive(Default)]
struct RecordingSink {
    progress: Mutex<Vec<(String, u8)>>,
    terminals: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn report_progress(&self, job: &JobId, percent: u8) {
        self.progress.lock().unwrap().push((job.to_string(), percent));
    }

    async fn report_terminal(&self, job: &JobId, status: &TerminalStatus) {
        let summary = match status {
            TerminalStatus::Completed { artifact } => format!("completed: {}", artifact.location),
            TerminalStatus::Failed { error } => format!("failed: {error}"),
        };
        self.terminals.lock().unwrap().push((job.to_string(), summary));
    }
}

/// Probe whose reading the test can turn like a dial.
#[derive(Clone)]
struct DialProbe {
    used_percent: Arc<Mutex<f64>>,
}

impl DialProbe {
    fn at(percent: f64) -> Self {
        DialProbe {
            used_percent: Arc::new(Mutex::new(percent)),
        }
    }

    fn set(&self, percent: f64) {
        *self.used_percent.lock().unwrap() = percent;
    }
}

impl MemoryProbe for DialProbe {
    fn read(&self) -> Result<MemoryCounters, ProbeError> {
        let percent = *self.used_percent.lock().unwrap();
        let total = 100_u64 * 1024 * 1024;
        let available = ((100.0 - percent) / 100.0 * total as f64) as u64;
        Ok(MemoryCounters {
            rss_bytes: 32 * 1024 * 1024,
            virtual_bytes: 64 * 1024 * 1024,
            system_total_bytes: total,
            system_available_bytes: available,
        })
    }
}

// ── Harness helpers ──────────────────────────────────────────────────────

/// Honours RUST_LOG when running with --nocapture; safe to call per test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn payload(target: DocumentFormat) -> JobPayload {
    JobPayload::new("inbox/source.pdf", DocumentFormat::Pdf, target)
}

async fn wait_terminal(engine: &Engine, id: &JobId) -> JobStatus {
    for _ in 0..600 {
        match engine.job_status(id).await {
            Some(status @ (JobStatus::Completed { .. } | JobStatus::Failed { .. })) => {
                return status
            }
            _ => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    panic!("job {id} did not reach a terminal state in time");
}

/// Poll the queue stats until `accept` holds or the timeout expires.
async fn wait_for_stats<F>(engine: &Engine, what: &str, accept: F)
where
    F: Fn(&pulpmill::QueueStats) -> bool,
{
    for _ in 0..600 {
        if accept(&engine.queue_stats().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue stats never reached: {what}");
}

// ── Whole-document lifecycle ─────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_small_job_completes_unchunked() {
    init_tracing();
    let store = SharedStore::new();
    let sink = Arc::new(RecordingSink::default());
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 3 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    )
    .with_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);

    let engine = Engine::start(EngineConfig::default(), services).unwrap();
    let id = engine.submit(payload(DocumentFormat::Txt), 0).await.unwrap();

    match wait_terminal(&engine, &id).await {
        JobStatus::Completed {
            artifact,
            attempts,
            chunks,
        } => {
            assert_eq!(attempts, 1);
            assert!(chunks.is_none(), "3 pages must not be chunked");
            assert_eq!(artifact.location, format!("{id}/result.txt"));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    let converted = store.get(&format!("{id}/result.txt")).unwrap();
    assert_eq!(&converted[..], b"md:%PDF source bytes");

    // The sink saw the milestones and a final 100 with the terminal report.
    let progress: Vec<u8> = sink
        .progress
        .lock()
        .unwrap()
        .iter()
        .map(|(_, p)| *p)
        .collect();
    assert!(progress.contains(&10) && progress.contains(&50) && progress.contains(&90));
    assert_eq!(progress.last().copied(), Some(100));
    let terminals = sink.terminals.lock().unwrap().clone();
    assert_eq!(terminals.len(), 1);
    assert!(terminals[0].1.starts_with("completed:"));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_document_is_chunked_and_merged_in_order() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 100 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder()
        .min_chunkable_pages(10)
        .default_chunk_size(5)
        .large_document_bytes(1)
        .build()
        .unwrap();

    // Pin pressure low so the chunk size stays at its configured default.
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();
    let id = engine
        .submit(payload(DocumentFormat::Markdown), 0)
        .await
        .unwrap();

    match wait_terminal(&engine, &id).await {
        JobStatus::Completed { artifact, chunks, .. } => {
            let summary = chunks.expect("a 100-page document must be chunked");
            assert_eq!(summary.chunk_count, 20);
            assert_eq!(artifact.location, format!("{id}/result.markdown"));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // Merged output must follow page order, whatever the upload order was.
    let merged = store.get(&format!("{id}/result.markdown")).unwrap();
    let text = String::from_utf8(merged.to_vec()).unwrap();
    assert!(text.starts_with("md:[0..4]"));
    assert!(text.ends_with("md:[95..99]"));
    let positions: Vec<usize> = (0..100)
        .step_by(5)
        .map(|start| {
            text.find(&format!("[{}..{}]", start, start + 4))
                .unwrap_or_else(|| panic!("range starting at {start} missing from merged output"))
        })
        .collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "chunk contents out of order in the merged artifact"
    );

    // Serial chunk execution: chunk uploads land in index order, the
    // combined result last.
    let uploads = store.uploads();
    assert_eq!(uploads.len(), 21);
    assert_eq!(uploads[0], format!("{id}/chunk-0000.markdown"));
    assert_eq!(uploads[19], format!("{id}/chunk-0019.markdown"));
    assert_eq!(uploads[20], format!("{id}/result.markdown"));

    engine.shutdown().await;
}

// ── Retry behaviour ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_retry_then_succeed() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::failing(2)),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder().max_attempts(3).build().unwrap();
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();

    let mut events = engine.subscribe();
    let id = engine.submit(payload(DocumentFormat::Txt), 5).await.unwrap();

    match wait_terminal(&engine, &id).await {
        JobStatus::Completed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected completion after retries, got {other:?}"),
    }

    // The event stream shows two retries with strictly increasing priority,
    // then the completion.
    let mut retry_priorities = Vec::new();
    let mut completed = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(1), events.next()).await
    {
        match event {
            Ok(JobEvent::Retried { priority, .. }) => retry_priorities.push(priority),
            Ok(JobEvent::Completed { attempts, .. }) => {
                assert_eq!(attempts, 3);
                completed = true;
                break;
            }
            Ok(JobEvent::Failed { error, .. }) => panic!("job failed: {error}"),
            _ => {}
        }
    }
    assert!(completed, "no completion event observed");
    assert_eq!(retry_priorities.len(), 2);
    assert!(retry_priorities[0] > 5 && retry_priorities[1] > retry_priorities[0]);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_attempts_keep_the_last_error_verbatim() {
    init_tracing();
    let store = SharedStore::new();
    let sink = Arc::new(RecordingSink::default());
    let services = ServiceSet::new(
        Arc::new(TagConverter::failing(99)),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    )
    .with_sink(Arc::clone(&sink) as Arc<dyn StatusSink>);
    let config = EngineConfig::builder().max_attempts(2).build().unwrap();
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();

    let id = engine.submit(payload(DocumentFormat::Txt), 0).await.unwrap();
    match wait_terminal(&engine, &id).await {
        JobStatus::Failed { error, attempts } => {
            assert_eq!(attempts, 2);
            assert!(
                error.contains("converter overloaded"),
                "expected the converter's message, got: {error}"
            );
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let terminals = sink.terminals.lock().unwrap().clone();
    assert_eq!(terminals.len(), 1, "exactly one terminal report");
    assert!(terminals[0].1.contains("converter overloaded"));

    engine.shutdown().await;
}

/// Runner that reports an assembly inconsistency, the one error class that
/// must never be retried.
struct BrokenAssemblyRunner;

#[async_trait]
impl JobRunner for BrokenAssemblyRunner {
    async fn run(
        &self,
        _ctx: JobContext,
        _progress: ProgressHandle,
    ) -> Result<JobOutcome, JobError> {
        Err(JobError::Assembly {
            detail: "chunk 3 missing from results".into(),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_structural_failures_are_terminal_on_the_first_attempt() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder().max_attempts(5).build().unwrap();
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();

    let id = engine
        .submit_runner(
            payload(DocumentFormat::Txt),
            0,
            SubmitOptions::default(),
            Arc::new(BrokenAssemblyRunner),
        )
        .await
        .unwrap();

    match wait_terminal(&engine, &id).await {
        JobStatus::Failed { error, attempts } => {
            assert_eq!(attempts, 1, "assembly errors must not consume the retry budget");
            assert!(error.contains("chunk 3 missing from results"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    engine.shutdown().await;
}

// ── Memory feedback ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_memory_pressure_throttles_pauses_and_recovers() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder()
        .concurrency(4)
        .sample_interval_ms(10)
        .build()
        .unwrap();
    let probe = DialProbe::at(40.0);
    let engine = Engine::start_with_probe(config, services, Arc::new(probe.clone())).unwrap();

    wait_for_stats(&engine, "first sample taken", |s| s.memory.is_some()).await;
    assert_eq!(engine.queue_stats().await.concurrency_limit, 4);

    // Sustained critical pressure halves the limit down to its floor.
    probe.set(85.0);
    wait_for_stats(&engine, "limit throttled to 1", |s| s.concurrency_limit == 1).await;
    assert!(!engine.queue_stats().await.memory_paused);

    // Emergency pauses intake entirely; a submission just queues.
    probe.set(95.0);
    wait_for_stats(&engine, "memory pause engaged", |s| s.memory_paused).await;
    let id = engine.submit(payload(DocumentFormat::Txt), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    match engine.job_status(&id).await {
        Some(JobStatus::Queued { position, .. }) => assert_eq!(position, 0),
        other => panic!("job must stay queued under emergency pressure, got {other:?}"),
    }

    // Recovery lifts the pause and restores the limit one step per signal.
    probe.set(40.0);
    wait_for_stats(&engine, "pause lifted and limit restored", |s| {
        !s.paused && s.concurrency_limit == 4
    })
    .await;
    match wait_terminal(&engine, &id).await {
        JobStatus::Completed { .. } => {}
        other => panic!("queued job should complete after recovery, got {other:?}"),
    }

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pressure_changes_are_published_as_events() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder()
        .sample_interval_ms(10)
        .build()
        .unwrap();
    let probe = DialProbe::at(40.0);
    let engine = Engine::start_with_probe(config, services, Arc::new(probe.clone())).unwrap();
    wait_for_stats(&engine, "first sample taken", |s| s.memory.is_some()).await;

    let mut events = engine.subscribe();
    probe.set(85.0);

    let mut saw_transition = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), events.next()).await
    {
        if let Ok(JobEvent::PressureChanged { to, used_percent, .. }) = event {
            assert_eq!(to, pulpmill::MemoryPressure::Critical);
            assert!((used_percent - 85.0).abs() < 1.0);
            saw_transition = true;
            break;
        }
    }
    assert!(saw_transition, "no pressure change event observed");

    engine.shutdown().await;
}

// ── Priority and operator control ────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_priorities_order_the_backlog_fifo_within_a_level() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::slow(Duration::from_millis(40))),
        Arc::new(MarkerPager { pages: 1 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder().concurrency(1).build().unwrap();
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();

    // Occupy the single slot, then pile up a backlog behind it.
    let occupier = engine.submit(payload(DocumentFormat::Txt), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    let low_a = engine.submit(payload(DocumentFormat::Txt), 1).await.unwrap();
    let high = engine.submit(payload(DocumentFormat::Txt), 5).await.unwrap();
    let mid = engine.submit(payload(DocumentFormat::Txt), 3).await.unwrap();
    let low_b = engine.submit(payload(DocumentFormat::Txt), 1).await.unwrap();

    for id in [&occupier, &low_a, &high, &mid, &low_b] {
        match wait_terminal(&engine, id).await {
            JobStatus::Completed { .. } => {}
            other => panic!("job {id} did not complete: {other:?}"),
        }
    }

    let order: Vec<String> = store
        .uploads()
        .iter()
        .filter(|key| key.contains("/result."))
        .map(|key| key.split('/').next().unwrap_or_default().to_string())
        .collect();
    let expected: Vec<String> = [&occupier, &high, &mid, &low_a, &low_b]
        .iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(order, expected, "completion order must follow priority, FIFO within a level");

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_holds_jobs_and_resume_releases_them() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let engine = Engine::start_with_probe(
        EngineConfig::default(),
        services,
        Arc::new(DialProbe::at(40.0)),
    )
    .unwrap();

    engine.pause().await;
    let id = engine.submit(payload(DocumentFormat::Txt), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    match engine.job_status(&id).await {
        Some(JobStatus::Queued { position, .. }) => assert_eq!(position, 0),
        other => panic!("paused engine must not dispatch, got {other:?}"),
    }
    let stats = engine.queue_stats().await;
    assert!(stats.paused && stats.operator_paused);
    assert_eq!(stats.queued, 1);

    engine.resume().await;
    match wait_terminal(&engine, &id).await {
        JobStatus::Completed { .. } => {}
        other => panic!("job should run after resume, got {other:?}"),
    }

    engine.shutdown().await;
}

// ── Reclamation ──────────────────────────────────────────────────────────

struct CountingCache {
    evictions: AtomicUsize,
}

impl ReclaimableCache for CountingCache {
    fn name(&self) -> &str {
        "render-cache"
    }

    fn evict_expired(&self, _ttl: Duration) -> usize {
        self.evictions.fetch_add(1, Ordering::SeqCst);
        7
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_force_reclaim_prunes_registered_caches() {
    init_tracing();
    let store = SharedStore::new();
    let services = ServiceSet::new(
        Arc::new(TagConverter::instant()),
        Arc::new(MarkerPager { pages: 2 }),
        Arc::clone(&store) as Arc<dyn ArtifactStore>,
    );
    let config = EngineConfig::builder()
        .reclaim_settle_ms(1)
        .build()
        .unwrap();
    let engine =
        Engine::start_with_probe(config, services, Arc::new(DialProbe::at(40.0))).unwrap();

    let cache = Arc::new(CountingCache {
        evictions: AtomicUsize::new(0),
    });
    engine.register_cache(Arc::clone(&cache) as Arc<dyn ReclaimableCache>);

    let outcome = engine.force_reclaim().await;
    assert!(outcome.success);
    assert_eq!(cache.evictions.load(Ordering::SeqCst), 1);
    assert!(
        outcome
            .actions
            .iter()
            .any(|a| a.contains("render-cache") && a.contains("7")),
        "actions should record the eviction: {:?}",
        outcome.actions
    );

    engine.shutdown().await;
}
