//! Deferred job scheduling.
//!
//! The orchestrator never blocks on a backend. Every step ends by handing a
//! [`ScheduledJob`] back to a [`DeferredScheduler`], with zero delay when the
//! next step can run straight away and with the poll interval when it waits
//! on the backend. Each experiment owns a single job id per direction, so
//! re-scheduling an id replaces whatever was pending for it.

mod manual;
mod timer;

pub use manual::{ManualScheduler, Submission};
pub use timer::{JobReceiver, TokioScheduler};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{Direction, SuperContext};
use crate::error::FormationResult;
use crate::step::Step;

/// Deterministic job identifier, one per experiment and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Job id for provisioning or stopping an experiment.
    #[must_use]
    pub fn for_experiment(sctx: &SuperContext) -> Self {
        let prefix = match sctx.direction {
            Direction::Start => "setup",
            Direction::Stop => "stop",
        };
        Self(format!("{prefix}-{}", sctx.experiment_id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A step waiting to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Queue the job belongs to.
    pub queue: String,
    /// Deduplication key within the queue.
    pub id: JobId,
    /// Step to run.
    pub step: Step,
    /// Experiment state.
    pub context: SuperContext,
}

impl ScheduledJob {
    /// Build a job for the given step.
    #[must_use]
    pub fn new(queue: impl Into<String>, step: Step, context: SuperContext) -> Self {
        Self {
            queue: queue.into(),
            id: JobId::for_experiment(&context),
            step,
            context,
        }
    }
}

/// Runs a job once after a delay.
#[async_trait]
pub trait DeferredScheduler: Send + Sync {
    /// Schedule `job` to run after `delay`.
    ///
    /// A job already pending under the same queue and id is replaced.
    async fn schedule(&self, job: ScheduledJob, delay: Duration) -> FormationResult<()>;
}
