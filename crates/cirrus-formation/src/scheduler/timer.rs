//! In-process scheduler backed by tokio timers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{DeferredScheduler, JobId, ScheduledJob};
use crate::error::{FormationError, FormationResult};

/// Receiving end for jobs whose delay has elapsed.
pub type JobReceiver = mpsc::UnboundedReceiver<ScheduledJob>;

type TimerKey = (String, JobId);

#[derive(Debug)]
struct Timer {
    generation: u64,
    handle: AbortHandle,
}

/// Scheduler that sleeps on the tokio runtime and delivers due jobs over a
/// channel.
///
/// Jobs are not persisted; a restart loses everything still pending.
#[derive(Debug)]
pub struct TokioScheduler {
    timers: Arc<DashMap<TimerKey, Timer>>,
    generation: AtomicU64,
    tx: mpsc::UnboundedSender<ScheduledJob>,
}

impl TokioScheduler {
    /// Create a scheduler and the receiver due jobs are delivered on.
    #[must_use]
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            tx,
        };
        (scheduler, rx)
    }

    /// Number of jobs waiting for their delay to elapse.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }

    /// Abort every pending timer.
    pub fn cancel_all(&self) {
        self.timers.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }
}

#[async_trait]
impl DeferredScheduler for TokioScheduler {
    async fn schedule(&self, job: ScheduledJob, delay: Duration) -> FormationResult<()> {
        if self.tx.is_closed() {
            return Err(FormationError::scheduler("job receiver has been dropped"));
        }

        let key: TimerKey = (job.queue.clone(), job.id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // The entry guard is held until the timer is registered, so a timer
        // that fires immediately cannot clean up before it is recorded.
        let entry = self.timers.entry(key.clone());

        let timers = Arc::clone(&self.timers);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timers.remove_if(&key, |_, timer| timer.generation == generation);

            let job_id = job.id.clone();
            if tx.send(job).is_err() {
                warn!(job_id = %job_id, "dropping due job, receiver closed");
            }
        });

        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        match entry {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(timer);
                previous.handle.abort();
                debug!(job_id = %occupied.key().1, "replaced pending job");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(timer);
            }
        }

        Ok(())
    }
}
