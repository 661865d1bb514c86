//! Provisioning orchestrator.
//!
//! The orchestrator drives one experiment's units to completion, strictly
//! one after another. Each call to [`Orchestrator::advance`] runs a single
//! [`Step`] for the unit under the cursor and re-submits the experiment's
//! [`SuperContext`] to the deferred scheduler:
//!
//! ```text
//! BeginUnit ──▶ pipeline entry step ──▶ ... ──▶ Done ──▶ cursor + 1 ──▶ BeginUnit
//!                        │                  │
//!                        │                  └── Poll: same or next wait step after the interval
//!                        ▼
//!                      Fail ──▶ Continue: cursor + 1 ──▶ BeginUnit
//!                          └──▶ Abort: undo the unit, skip the rest
//! ```
//!
//! When the cursor moves past the last unit the experiment is completed in
//! the same step; no further job is submitted.
//!
//! Backend-specific steps live in a [`Pipeline`], one per backend kind. The
//! engine owns polling bounds, failure handling and cursor movement, so both
//! pipelines share the same wait/retry skeleton.

mod compute;
mod service;

pub use compute::ComputeStackPipeline;
pub use service::OrchestratorServicePipeline;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterFactory;
use crate::config::FormationConfig;
use crate::context::{Direction, JobContext, SuperContext, UndoAction, UnitOutcome};
use crate::error::FormationResult;
use crate::policy::FailurePolicy;
use crate::scheduler::{DeferredScheduler, ScheduledJob};
use crate::step::{Step, Transition};
use crate::store::FormationStore;
use crate::types::UnitDescriptor;

/// Backend-specific half of the state machine.
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// First step of a unit in the given direction.
    fn entry_step(&self, direction: Direction) -> Step;

    /// Run one step against the backend.
    ///
    /// Errors are turned into a unit failure by the engine.
    async fn run(&self, step: Step, ctx: &mut JobContext) -> FormationResult<Transition>;

    /// Run one compensating action.
    async fn undo(&self, action: &UndoAction) -> FormationResult<()>;
}

/// Receives the outcome of each unit and of the whole experiment.
#[async_trait]
pub trait ProvisionObserver: Send + Sync {
    /// The unit at `index` reached its goal.
    async fn unit_succeeded(&self, sctx: &SuperContext, index: usize);

    /// The unit at `index` failed.
    async fn unit_failed(&self, sctx: &SuperContext, index: usize, reason: &str);

    /// Every unit has been processed.
    async fn completed(&self, sctx: &SuperContext);

    /// A failed unit was rolled back and the remaining units skipped.
    async fn rolled_back(&self, sctx: &SuperContext, reason: &str);

    /// The next step could not be scheduled; nothing else will run.
    async fn halted(&self, sctx: &SuperContext, reason: &str);
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Queue jobs are submitted to.
    pub queue: String,
    /// Delay before re-checking a pending backend operation.
    pub poll_interval: Duration,
    /// Re-arm limit per wait state, `None` when unbounded.
    pub max_poll_attempts: Option<u32>,
    /// What to do with the rest of an experiment once a unit fails.
    pub failure_policy: FailurePolicy,
}

impl OrchestratorSettings {
    /// Build settings from configuration.
    #[must_use]
    pub fn from_config(config: &FormationConfig) -> Self {
        Self {
            queue: config.scheduler.queue.clone(),
            poll_interval: config.scheduler.poll_interval(),
            max_poll_attempts: config.scheduler.poll_limit(),
            failure_policy: config.orchestrator.failure_policy,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&FormationConfig::default())
    }
}

/// Drives experiments through their provisioning steps.
pub struct Orchestrator {
    scheduler: Arc<dyn DeferredScheduler>,
    adapters: Arc<dyn AdapterFactory>,
    store: Arc<dyn FormationStore>,
    observer: Arc<dyn ProvisionObserver>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        scheduler: Arc<dyn DeferredScheduler>,
        adapters: Arc<dyn AdapterFactory>,
        store: Arc<dyn FormationStore>,
        observer: Arc<dyn ProvisionObserver>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            scheduler,
            adapters,
            store,
            observer,
            settings,
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one scheduled step and re-arm the experiment.
    ///
    /// Never fails: every error ends up as a unit failure or a halted
    /// experiment, reported through the observer.
    pub async fn advance(&self, job: ScheduledJob) {
        let step = job.step;
        let mut sctx = job.context;

        if step == Step::BeginUnit {
            self.begin_unit(sctx).await;
            return;
        }

        if sctx.is_complete() {
            warn!(
                experiment_id = %sctx.experiment_id,
                step = %step,
                "ignoring step for an experiment with no unit left"
            );
            return;
        }

        let transition = self.run_step(step, &mut sctx).await;
        self.apply(step, transition, sctx).await;
    }

    fn pipeline_for(&self, unit: &UnitDescriptor) -> FormationResult<Box<dyn Pipeline>> {
        match unit {
            UnitDescriptor::ComputeStack(compute) => {
                let adapter = self.adapters.compute_stack(&compute.backend_key)?;
                Ok(Box::new(ComputeStackPipeline::new(
                    adapter,
                    Arc::clone(&self.store),
                )))
            }
            UnitDescriptor::OrchestratorService(service) => {
                let adapter = self.adapters.orchestrator_service(&service.backend_key)?;
                Ok(Box::new(OrchestratorServicePipeline::new(adapter)))
            }
        }
    }

    async fn begin_unit(&self, sctx: SuperContext) {
        let index = sctx.current_unit_index;
        let Some(ctx) = sctx.current() else {
            warn!(
                experiment_id = %sctx.experiment_id,
                unit = index,
                "ignoring unit start past the last unit"
            );
            return;
        };

        let entry = match self.pipeline_for(&ctx.unit) {
            Ok(pipeline) => {
                info!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    name = %ctx.resource_name,
                    pipeline = pipeline.name(),
                    direction = sctx.direction.as_str(),
                    "unit started"
                );
                pipeline.entry_step(sctx.direction)
            }
            Err(e) => {
                let reason = format!("no adapter for unit: {e}");
                self.fail_unit(sctx, reason).await;
                return;
            }
        };

        self.submit(entry, sctx, Duration::ZERO).await;
    }

    async fn run_step(&self, step: Step, sctx: &mut SuperContext) -> Transition {
        let index = sctx.current_unit_index;
        let Some(ctx) = sctx.job_contexts.get_mut(index) else {
            return Transition::fail("no unit under the cursor");
        };

        let pipeline = match self.pipeline_for(&ctx.unit) {
            Ok(pipeline) => pipeline,
            Err(e) => return Transition::fail(format!("no adapter for unit: {e}")),
        };

        match pipeline.run(step, ctx).await {
            Ok(transition) => transition,
            Err(e) => {
                error!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    name = %ctx.resource_name,
                    step = %step,
                    backend = e.is_backend(),
                    error = %e,
                    "step raised an error"
                );
                Transition::Fail(format!("{step}: {e}"))
            }
        }
    }

    async fn apply(&self, step: Step, transition: Transition, mut sctx: SuperContext) {
        let index = sctx.current_unit_index;
        match transition {
            Transition::Next(next) => {
                if let Some(ctx) = sctx.job_contexts.get_mut(index) {
                    ctx.attempts = 0;
                }
                debug!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    step = %next,
                    "next step"
                );
                self.submit(next, sctx, Duration::ZERO).await;
            }
            Transition::Poll(next) => {
                let Some(ctx) = sctx.job_contexts.get_mut(index) else {
                    return;
                };
                ctx.attempts = if next == step {
                    ctx.attempts.saturating_add(1)
                } else {
                    0
                };
                let attempts = ctx.attempts;

                if let Some(limit) = self.settings.max_poll_attempts {
                    if attempts > limit {
                        let reason = format!("{next} still pending after {limit} polls");
                        self.fail_unit(sctx, reason).await;
                        return;
                    }
                }

                debug!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    step = %next,
                    attempt = attempts,
                    "waiting on backend"
                );
                self.submit(next, sctx, self.settings.poll_interval).await;
            }
            Transition::Done => self.succeed_unit(sctx).await,
            Transition::Fail(reason) => self.fail_unit(sctx, reason).await,
        }
    }

    async fn succeed_unit(&self, mut sctx: SuperContext) {
        let index = sctx.current_unit_index;
        if let Some(ctx) = sctx.job_contexts.get_mut(index) {
            ctx.outcome = Some(UnitOutcome::Succeeded);
            ctx.operation = None;
            ctx.attempts = 0;
            info!(
                experiment_id = %sctx.experiment_id,
                unit = index,
                name = %ctx.resource_name,
                "unit done"
            );
        }

        self.observer.unit_succeeded(&sctx, index).await;
        self.next_unit(sctx).await;
    }

    /// Move the cursor on. The last unit finishes the experiment in place.
    async fn next_unit(&self, mut sctx: SuperContext) {
        sctx.advance_cursor();
        if sctx.is_complete() {
            info!(
                experiment_id = %sctx.experiment_id,
                direction = sctx.direction.as_str(),
                failed = sctx.failed_units.len(),
                "all units processed"
            );
            self.observer.completed(&sctx).await;
            return;
        }
        self.submit(Step::BeginUnit, sctx, Duration::ZERO).await;
    }

    async fn fail_unit(&self, mut sctx: SuperContext, reason: String) {
        let index = sctx.current_unit_index;
        if let Some(ctx) = sctx.job_contexts.get_mut(index) {
            ctx.outcome = Some(UnitOutcome::Failed {
                reason: reason.clone(),
            });
            ctx.operation = None;
            error!(
                experiment_id = %sctx.experiment_id,
                unit = index,
                name = %ctx.resource_name,
                reason = %reason,
                "unit failed"
            );
        }
        if !sctx.failed_units.contains(&index) {
            sctx.failed_units.push(index);
        }

        self.observer.unit_failed(&sctx, index, &reason).await;

        match self.settings.failure_policy {
            FailurePolicy::Continue => {
                warn!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    "moving on to the next unit, created resources are left in place"
                );
                self.next_unit(sctx).await;
            }
            FailurePolicy::Abort => {
                self.roll_back(&mut sctx).await;
                sctx.abort();
                self.observer.rolled_back(&sctx, &reason).await;
            }
        }
    }

    /// Undo everything the current unit created, most recent first.
    async fn roll_back(&self, sctx: &mut SuperContext) {
        let index = sctx.current_unit_index;
        let Some(ctx) = sctx.job_contexts.get_mut(index) else {
            return;
        };
        if ctx.undo.is_empty() {
            return;
        }

        let pipeline = match self.pipeline_for(&ctx.unit) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    error = %e,
                    "cannot roll back unit"
                );
                return;
            }
        };

        while let Some(action) = ctx.undo.pop() {
            match pipeline.undo(&action).await {
                Ok(()) => info!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    action = ?action,
                    "rolled back"
                ),
                Err(e) => warn!(
                    experiment_id = %sctx.experiment_id,
                    unit = index,
                    action = ?action,
                    error = %e,
                    "rollback action failed, continuing"
                ),
            }
        }
    }

    async fn submit(&self, step: Step, sctx: SuperContext, delay: Duration) {
        let job = ScheduledJob::new(self.settings.queue.clone(), step, sctx.clone());
        if let Err(e) = self.scheduler.schedule(job, delay).await {
            error!(
                experiment_id = %sctx.experiment_id,
                unit = sctx.current_unit_index,
                step = %step,
                error = %e,
                "failed to schedule step"
            );
            self.observer.halted(&sctx, &e.to_string()).await;
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
