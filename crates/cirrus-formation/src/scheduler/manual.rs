//! Scheduler that records submissions instead of running them.
//!
//! Used to drive the orchestrator one step at a time: the caller pops the
//! next due job and feeds it to `Orchestrator::advance`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{DeferredScheduler, ScheduledJob};
use crate::error::{FormationError, FormationResult};
use crate::step::Step;

/// A recorded call to [`DeferredScheduler::schedule`].
#[derive(Debug, Clone)]
pub struct Submission {
    /// The job as submitted.
    pub job: ScheduledJob,
    /// Requested delay.
    pub delay: Duration,
}

impl Submission {
    /// Step the job will run.
    #[must_use]
    pub const fn step(&self) -> Step {
        self.job.step
    }

    /// Cursor position at submission time.
    #[must_use]
    pub const fn unit_index(&self) -> usize {
        self.job.context.current_unit_index
    }
}

#[derive(Debug, Default)]
struct ManualState {
    pending: VecDeque<Submission>,
    history: Vec<Submission>,
    fail_next: Option<String>,
}

/// Deterministic scheduler for tests and dry runs.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the oldest pending job.
    pub fn pop(&self) -> Option<Submission> {
        self.state().pending.pop_front()
    }

    /// Number of pending jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    /// Every submission accepted so far, in order.
    #[must_use]
    pub fn history(&self) -> Vec<Submission> {
        self.state().history.clone()
    }

    /// Make the next call to `schedule` fail.
    pub fn fail_next_submission(&self, message: &str) {
        self.state().fail_next = Some(message.to_owned());
    }
}

#[async_trait]
impl DeferredScheduler for ManualScheduler {
    async fn schedule(&self, job: ScheduledJob, delay: Duration) -> FormationResult<()> {
        let mut state = self.state();
        if let Some(message) = state.fail_next.take() {
            return Err(FormationError::scheduler(message));
        }

        state
            .pending
            .retain(|s| !(s.job.queue == job.queue && s.job.id == job.id));

        let submission = Submission { job, delay };
        state.history.push(submission.clone());
        state.pending.push_back(submission);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::context::{Direction, SuperContext};
    use crate::types::ExperimentId;

    fn job(step: Step) -> ScheduledJob {
        let sctx = SuperContext::new(ExperimentId::new("e1"), Direction::Start, vec![]);
        ScheduledJob::new("formation", step, sctx)
    }

    #[tokio::test]
    async fn same_id_replaces_pending_job() {
        let scheduler = ManualScheduler::new();
        scheduler
            .schedule(job(Step::BeginUnit), Duration::ZERO)
            .await
            .unwrap();
        scheduler
            .schedule(job(Step::SetupStorage), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.history().len(), 2);

        let next = scheduler.pop().unwrap();
        assert_eq!(next.step(), Step::SetupStorage);
        assert_eq!(next.delay, Duration::from_secs(10));
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn injected_failure_applies_once() {
        let scheduler = ManualScheduler::new();
        scheduler.fail_next_submission("queue offline");

        assert!(scheduler
            .schedule(job(Step::BeginUnit), Duration::ZERO)
            .await
            .is_err());
        assert!(scheduler
            .schedule(job(Step::BeginUnit), Duration::ZERO)
            .await
            .is_ok());
        assert_eq!(scheduler.history().len(), 1);
    }
}
