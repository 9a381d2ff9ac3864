//! Scheduler driver: turns queue state into running attempts.
//!
//! One spawned task owns the dispatch loop. Each ready job runs in its own
//! task and reports back over a completion channel, so the driver never
//! waits on job work and the queue lock is never held across an await of
//! it. Panics inside a runner are caught and routed through the normal
//! failure path; a panicking job costs its own attempt, never the engine.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::JobError;
use crate::events::{EventBus, JobEvent};
use crate::external::{StatusSink, TerminalStatus};
use crate::job::{JobId, JobOutcome, ProgressHandle, ProgressUpdate};
use crate::queue::{Dispatch, JobQueue, RetryDecision};

/// Fallback wake-up so a missed notify can only delay dispatch, not stall
/// it.
const SAFETY_TICK: Duration = Duration::from_millis(500);

/// What a finished attempt sends back to the driver.
struct AttemptOutcome {
    id: JobId,
    result: Result<JobOutcome, JobError>,
}

/// The dispatch loop. Constructed by the engine, consumed by [`Self::run`].
pub(crate) struct Scheduler {
    queue: Arc<JobQueue>,
    sink: Arc<dyn StatusSink>,
    events: Arc<EventBus>,
    job_deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(
        queue: Arc<JobQueue>,
        sink: Arc<dyn StatusSink>,
        events: Arc<EventBus>,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Scheduler {
            queue,
            sink,
            events,
            job_deadline: config.job_deadline_ms.map(Duration::from_millis),
            cancel,
        }
    }

    /// Drives dispatch until cancelled.
    ///
    /// On cancellation the loop stops handing out work and returns;
    /// attempts already in flight are detached and their late completions
    /// are dropped with the channel.
    pub(crate) async fn run(self) {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<AttemptOutcome>();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let mut safety_tick = tokio::time::interval(SAFETY_TICK);
        safety_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(deadline = ?self.job_deadline, "scheduler driver started");
        loop {
            self.dispatch_ready(&completion_tx, &progress_tx).await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("scheduler driver stopping");
                    break;
                }
                Some(done) = completion_rx.recv() => {
                    self.handle_completion(done).await;
                }
                Some(update) = progress_rx.recv() => {
                    self.handle_progress(update).await;
                }
                _ = self.queue.work_notify.notified() => {}
                _ = safety_tick.tick() => {}
            }
        }
    }

    /// Starts every job the queue is willing to hand out right now.
    async fn dispatch_ready(
        &self,
        completion_tx: &mpsc::UnboundedSender<AttemptOutcome>,
        progress_tx: &mpsc::UnboundedSender<ProgressUpdate>,
    ) {
        while let Some(dispatch) = self.queue.take_next().await {
            self.spawn_attempt(dispatch, completion_tx.clone(), progress_tx.clone());
        }
    }

    fn spawn_attempt(
        &self,
        dispatch: Dispatch,
        completion_tx: mpsc::UnboundedSender<AttemptOutcome>,
        progress_tx: mpsc::UnboundedSender<ProgressUpdate>,
    ) {
        let Dispatch { ctx, runner } = dispatch;
        self.events.emit(JobEvent::Started {
            id: ctx.id.clone(),
            attempt: ctx.attempt,
        });
        let progress = ProgressHandle::new(ctx.id.clone(), progress_tx);
        let deadline = self.job_deadline;

        tokio::spawn(async move {
            let job_id = ctx.id.clone();
            let attempt = AssertUnwindSafe(runner.run(ctx, progress)).catch_unwind();
            let result = match deadline {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(caught) => settle_caught(&job_id, caught),
                    Err(_) => {
                        let limit_ms = limit.as_millis() as u64;
                        warn!(
                            job = %job_id,
                            limit_ms,
                            "attempt exceeded the per-job deadline"
                        );
                        Err(JobError::DeadlineExceeded { limit_ms })
                    }
                },
                None => settle_caught(&job_id, attempt.await),
            };
            // Fails only after shutdown, when nobody is left to care.
            let _ = completion_tx.send(AttemptOutcome { id: job_id, result });
        });
    }

    async fn handle_progress(&self, update: ProgressUpdate) {
        self.queue.record_progress(&update.id, update.percent).await;
        self.events.emit(JobEvent::Progress {
            id: update.id.clone(),
            percent: update.percent,
        });
        self.sink.report_progress(&update.id, update.percent).await;
    }

    async fn handle_completion(&self, done: AttemptOutcome) {
        match done.result {
            Ok(outcome) => {
                let Some(record) = self.queue.mark_completed(&done.id, outcome).await else {
                    return;
                };
                self.events.emit(JobEvent::Completed {
                    id: record.id.clone(),
                    attempts: record.attempts,
                    artifact: record.outcome.artifact.clone(),
                });
                self.sink.report_progress(&record.id, 100).await;
                self.sink
                    .report_terminal(
                        &record.id,
                        &TerminalStatus::Completed {
                            artifact: record.outcome.artifact,
                        },
                    )
                    .await;
            }
            Err(error) => match self.queue.mark_failed(&done.id, error).await {
                RetryDecision::Requeued {
                    attempts_so_far,
                    priority,
                } => {
                    self.events.emit(JobEvent::Retried {
                        id: done.id,
                        attempts_so_far,
                        priority,
                    });
                }
                RetryDecision::Terminal(record) => {
                    self.events.emit(JobEvent::Failed {
                        id: record.id.clone(),
                        attempts: record.attempts,
                        error: record.error.clone(),
                    });
                    self.sink
                        .report_terminal(
                            &record.id,
                            &TerminalStatus::Failed {
                                error: record.error.to_string(),
                            },
                        )
                        .await;
                }
                RetryDecision::Unknown => {}
            },
        }
    }
}

/// Unwraps a caught attempt, converting a panic payload into a structural
/// job failure.
fn settle_caught(
    id: &JobId,
    caught: Result<Result<JobOutcome, JobError>, Box<dyn std::any::Any + Send>>,
) -> Result<JobOutcome, JobError> {
    match caught {
        Ok(result) => result,
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            error!(job = %id, "job runner panicked: {detail}");
            Err(JobError::Internal(format!("runner panicked: {detail}")))
        }
    }
}
