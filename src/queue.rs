//! Priority job queue with adaptive concurrency.
//!
//! [`JobQueue`] is the single decision point for scheduling: which job runs
//! next, how many run at once, and what happens when one fails. The
//! scheduler driver ([`crate::scheduler`]) polls it; the memory sampler
//! steers it through [`JobQueue::on_memory_signal`].
//!
//! ## Why a single lock
//!
//! Every transition — dequeue, completion, retry, limit change, pause —
//! mutates interdependent state (pending heap, active map, limit, flags).
//! One mutex over all of it makes each transition atomic, which is what
//! keeps the active count at or below the limit under any interleaving.
//! The lock is only ever held for bookkeeping; job execution happens
//! entirely outside it.
//!
//! ## Ordering
//!
//! Higher priority dispatches first. Within a priority level jobs run in
//! submission order, via a monotonic sequence stamp. Retries re-enter the
//! heap with boosted priority and a fresh stamp, so a struggling job moves
//! ahead of its original cohort but behind none of its new one.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::JobError;
use crate::job::{Job, JobContext, JobId, JobOutcome, JobPayload, JobRunner, SubmitOptions};
use crate::memory::{MemoryPressure, MemoryStatus};

/// Heap entry ordering: priority descending, then sequence ascending.
struct PendingJob(Job);

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.sequence == other.0.sequence
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

/// Fixed-capacity record log; pushing beyond capacity evicts the oldest.
struct BoundedLog<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedLog<T> {
    fn new(capacity: usize) -> Self {
        BoundedLog {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Terminal record of a successful job.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedJob {
    pub id: JobId,
    pub correlation_id: String,
    /// Total attempts including the successful one.
    pub attempts: u32,
    pub outcome: JobOutcome,
}

/// Terminal record of a failed job.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub id: JobId,
    pub correlation_id: String,
    pub attempts: u32,
    /// The last attempt's error, preserved verbatim.
    pub error: JobError,
}

/// What [`JobQueue::mark_failed`] decided.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    /// Re-queued for another attempt at a boosted priority.
    Requeued { attempts_so_far: u32, priority: i32 },
    /// Attempts exhausted or the error was structural.
    Terminal(FailedJob),
    /// The id was not in the active set; nothing was done.
    Unknown,
}

/// Where a job currently is, as seen by a status poller.
#[derive(Debug, Clone)]
pub enum JobView {
    Queued {
        /// Jobs that would dispatch before this one.
        position: usize,
        priority: i32,
        attempts: u32,
    },
    Active {
        percent: u8,
        attempt: u32,
    },
    Completed(CompletedJob),
    Failed(FailedJob),
}

/// Point-in-time queue counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub concurrency_limit: usize,
    pub base_concurrency: usize,
    /// True when either pause cause is in effect.
    pub paused: bool,
    pub operator_paused: bool,
    pub memory_paused: bool,
    pub memory: Option<MemoryStatus>,
    pub completed_retained: usize,
    pub failed_retained: usize,
}

/// A job handed to the scheduler for execution.
pub(crate) struct Dispatch {
    pub ctx: JobContext,
    pub runner: Arc<dyn JobRunner>,
}

struct QueueState {
    pending: BinaryHeap<PendingJob>,
    active: HashMap<JobId, Job>,
    /// Last reported percent per active job.
    progress: HashMap<JobId, u8>,
    completed: BoundedLog<CompletedJob>,
    failed: BoundedLog<FailedJob>,
    concurrency_limit: usize,
    operator_paused: bool,
    memory_paused: bool,
    next_sequence: u64,
    last_memory: Option<MemoryStatus>,
}

/// The queue state machine. See the module docs for the locking story.
pub struct JobQueue {
    state: Mutex<QueueState>,
    base_concurrency: usize,
    default_max_attempts: u32,
    retry_priority_boost: i32,
    throttle_factor: f64,
    /// Wakes the scheduler driver: new work, freed slot, resume.
    pub(crate) work_notify: Notify,
}

impl JobQueue {
    pub fn new(config: &EngineConfig) -> Self {
        JobQueue {
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                active: HashMap::new(),
                progress: HashMap::new(),
                completed: BoundedLog::new(config.result_retention),
                failed: BoundedLog::new(config.result_retention),
                concurrency_limit: config.concurrency,
                operator_paused: false,
                memory_paused: false,
                next_sequence: 0,
                last_memory: None,
            }),
            base_concurrency: config.concurrency,
            default_max_attempts: config.max_attempts,
            retry_priority_boost: config.retry_priority_boost,
            throttle_factor: config.throttle_factor,
            work_notify: Notify::new(),
        }
    }

    /// Enqueues a job and wakes the driver.
    ///
    /// Caller-supplied ids must be unique across live jobs; reusing one
    /// leaves status lookups ambiguous.
    pub async fn submit(
        &self,
        payload: JobPayload,
        priority: i32,
        options: SubmitOptions,
        runner: Arc<dyn JobRunner>,
    ) -> JobId {
        let id = options.id.unwrap_or_else(JobId::generate);
        let correlation_id = options.correlation_id.unwrap_or_else(|| id.to_string());
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);

        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let job = Job {
            id: id.clone(),
            correlation_id,
            payload,
            priority,
            attempts: 0,
            max_attempts,
            sequence,
            submitted_at: Instant::now(),
            last_error: None,
            runner,
        };
        info!(job = %id, priority, sequence, "job submitted");
        state.pending.push(PendingJob(job));
        drop(state);

        self.work_notify.notify_one();
        id
    }

    /// Pops the next eligible job and marks it active, as one atomic step.
    ///
    /// Eligible means: not paused by either cause, and the active count is
    /// below the current limit. Returns `None` when nothing qualifies;
    /// never blocks.
    pub(crate) async fn take_next(&self) -> Option<Dispatch> {
        let mut state = self.state.lock().await;
        if state.operator_paused || state.memory_paused {
            return None;
        }
        if state.active.len() >= state.concurrency_limit {
            return None;
        }
        let PendingJob(job) = state.pending.pop()?;
        let dispatch = Dispatch {
            ctx: job.context(),
            runner: Arc::clone(&job.runner),
        };
        debug!(
            job = %job.id,
            priority = job.priority,
            attempt = dispatch.ctx.attempt,
            waited_ms = job.submitted_at.elapsed().as_millis() as u64,
            "job dispatched"
        );
        state.progress.insert(job.id.clone(), 0);
        state.active.insert(job.id.clone(), job);
        Some(dispatch)
    }

    /// Records a successful run and frees the slot.
    pub async fn mark_completed(&self, id: &JobId, outcome: JobOutcome) -> Option<CompletedJob> {
        let mut state = self.state.lock().await;
        let Some(job) = state.active.remove(id) else {
            warn!(job = %id, "completion for a job not in the active set");
            return None;
        };
        state.progress.remove(id);
        let record = CompletedJob {
            id: id.clone(),
            correlation_id: job.correlation_id,
            attempts: job.attempts + 1,
            outcome,
        };
        info!(job = %id, attempts = record.attempts, "job completed");
        state.completed.push(record.clone());
        drop(state);

        self.work_notify.notify_one();
        Some(record)
    }

    /// Records a failed attempt and decides between retry and terminal
    /// failure.
    ///
    /// Retryable errors re-queue with the priority boost while attempts
    /// remain; structural errors and exhausted budgets move the job to the
    /// failed log with the last error kept verbatim.
    pub async fn mark_failed(&self, id: &JobId, error: JobError) -> RetryDecision {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.active.remove(id) else {
            warn!(job = %id, "failure for a job not in the active set");
            return RetryDecision::Unknown;
        };
        state.progress.remove(id);
        job.attempts += 1;
        job.last_error = Some(error.clone());

        if error.is_retryable() && job.attempts < job.max_attempts {
            job.priority = job.priority.saturating_add(self.retry_priority_boost);
            job.sequence = state.next_sequence;
            state.next_sequence += 1;
            let decision = RetryDecision::Requeued {
                attempts_so_far: job.attempts,
                priority: job.priority,
            };
            warn!(
                job = %id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                priority = job.priority,
                "attempt failed, retrying: {error}"
            );
            state.pending.push(PendingJob(job));
            drop(state);
            self.work_notify.notify_one();
            decision
        } else {
            let record = FailedJob {
                id: id.clone(),
                correlation_id: job.correlation_id,
                attempts: job.attempts,
                error,
            };
            warn!(
                job = %id,
                attempts = record.attempts,
                "job failed terminally: {}",
                record.error
            );
            state.failed.push(record.clone());
            drop(state);
            self.work_notify.notify_one();
            RetryDecision::Terminal(record)
        }
    }

    /// Adapts scheduling to a memory signal.
    ///
    /// Critical shrinks the limit by the throttle factor (floor 1);
    /// emergency pauses intake; healthy signals unpause and restore the
    /// limit one step per signal up to the configured base. The gradual
    /// restore is deliberate: usage hovering around a threshold would
    /// otherwise snap the limit up and down every sample.
    pub async fn on_memory_signal(&self, status: &MemoryStatus) {
        let mut state = self.state.lock().await;
        state.last_memory = Some(status.clone());
        match status.pressure {
            MemoryPressure::Critical => {
                let reduced =
                    ((state.concurrency_limit as f64 * self.throttle_factor).floor() as usize)
                        .max(1);
                if reduced < state.concurrency_limit {
                    info!(
                        from = state.concurrency_limit,
                        to = reduced,
                        used_percent = status.used_percent,
                        "memory critical, reducing concurrency"
                    );
                    state.concurrency_limit = reduced;
                }
            }
            MemoryPressure::Emergency => {
                if !state.memory_paused {
                    warn!(
                        used_percent = status.used_percent,
                        "memory emergency, pausing job intake"
                    );
                    state.memory_paused = true;
                }
            }
            MemoryPressure::Ok | MemoryPressure::Warning => {
                let mut changed = false;
                if state.memory_paused {
                    info!("memory recovered, resuming job intake");
                    state.memory_paused = false;
                    changed = true;
                }
                if state.concurrency_limit < self.base_concurrency {
                    state.concurrency_limit += 1;
                    info!(limit = state.concurrency_limit, "restoring concurrency");
                    changed = true;
                }
                if changed {
                    drop(state);
                    self.work_notify.notify_one();
                }
            }
        }
    }

    /// Operator pause: active jobs finish, nothing new dispatches.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if !state.operator_paused {
            info!("queue paused by operator");
            state.operator_paused = true;
        }
    }

    /// Clears the operator pause. Memory pause, if any, still applies.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if state.operator_paused {
            info!("queue resumed by operator");
            state.operator_paused = false;
            drop(state);
            self.work_notify.notify_one();
        }
    }

    /// Updates the progress percent of an active job; ignored otherwise.
    pub async fn record_progress(&self, id: &JobId, percent: u8) {
        let mut state = self.state.lock().await;
        if state.active.contains_key(id) {
            state.progress.insert(id.clone(), percent.min(100));
        }
    }

    /// Finds a job in whichever set currently holds it.
    pub async fn find(&self, id: &JobId) -> Option<JobView> {
        let state = self.state.lock().await;
        if let Some(job) = state.active.get(id) {
            return Some(JobView::Active {
                percent: state.progress.get(id).copied().unwrap_or(0),
                attempt: job.attempts + 1,
            });
        }
        if let Some(PendingJob(job)) = state.pending.iter().find(|p| p.0.id == *id) {
            let position = state
                .pending
                .iter()
                .filter(|other| {
                    (other.0.priority, std::cmp::Reverse(other.0.sequence))
                        > (job.priority, std::cmp::Reverse(job.sequence))
                })
                .count();
            return Some(JobView::Queued {
                position,
                priority: job.priority,
                attempts: job.attempts,
            });
        }
        if let Some(record) = state.completed.iter().find(|r| r.id == *id) {
            return Some(JobView::Completed(record.clone()));
        }
        if let Some(record) = state.failed.iter().find(|r| r.id == *id) {
            return Some(JobView::Failed(record.clone()));
        }
        None
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.pending.len(),
            active: state.active.len(),
            concurrency_limit: state.concurrency_limit,
            base_concurrency: self.base_concurrency,
            paused: state.operator_paused || state.memory_paused,
            operator_paused: state.operator_paused,
            memory_paused: state.memory_paused,
            memory: state.last_memory.clone(),
            completed_retained: state.completed.len(),
            failed_retained: state.failed.len(),
        }
    }
}
