//! Job lifecycle event stream.
//!
//! The engine broadcasts an event for every externally visible transition.
//! Subscribers get an independent [`BroadcastStream`]; a slow subscriber
//! lags and drops old events rather than stalling the engine, and having
//! no subscribers at all is the normal idle case.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::JobError;
use crate::external::StoredArtifact;
use crate::job::JobId;
use crate::memory::MemoryPressure;

/// Buffered events per subscriber before lagging kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// An externally visible engine transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted {
        id: JobId,
        priority: i32,
    },
    Started {
        id: JobId,
        attempt: u32,
    },
    Progress {
        id: JobId,
        percent: u8,
    },
    /// A retryable failure with attempts left in the budget.
    Retried {
        id: JobId,
        attempts_so_far: u32,
        priority: i32,
    },
    Completed {
        id: JobId,
        attempts: u32,
        artifact: StoredArtifact,
    },
    Failed {
        id: JobId,
        attempts: u32,
        error: JobError,
    },
    /// The sampled memory classification changed.
    PressureChanged {
        from: MemoryPressure,
        to: MemoryPressure,
        used_percent: f64,
    },
}

/// Fan-out sender; cheap to share, fine with zero listeners.
pub(crate) struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus { tx }
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // Send only fails when nobody is subscribed, which is not an error.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> BroadcastStream<JobEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
