//! Experiment lifecycle bridge.
//!
//! [`ExperimentLifecycle`] is the entry point used by the experiment service:
//! it validates a start or stop request, records the experiment's new status
//! and environments, and hands the first job to the scheduler. It also
//! receives unit outcomes from the orchestrator and folds them back into the
//! stored experiment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::context::{Direction, SuperContext};
use crate::error::{FormationError, FormationResult};
use crate::orchestrator::ProvisionObserver;
use crate::scheduler::{DeferredScheduler, ScheduledJob};
use crate::step::Step;
use crate::store::FormationStore;
use crate::types::{
    EnvironmentStatus, ExperimentId, ExperimentRecord, ExperimentStatus, HackathonId,
    UnitDescriptor, VirtualEnvironment,
};

/// Starts and stops experiments and tracks their status.
pub struct ExperimentLifecycle {
    store: Arc<dyn FormationStore>,
    scheduler: Arc<dyn DeferredScheduler>,
    queue: String,
}

impl ExperimentLifecycle {
    /// Create a new lifecycle bridge.
    pub fn new(
        store: Arc<dyn FormationStore>,
        scheduler: Arc<dyn DeferredScheduler>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            scheduler,
            queue: queue.into(),
        }
    }

    /// Provision every unit of an experiment.
    ///
    /// Returns once the first step is scheduled; progress is reported through
    /// the stored experiment status.
    pub async fn start(
        &self,
        experiment_id: &ExperimentId,
        hackathon_id: &HackathonId,
        units: Vec<UnitDescriptor>,
    ) -> FormationResult<()> {
        let mut experiment = self.load(experiment_id).await?;

        if &experiment.hackathon_id != hackathon_id {
            let err = FormationError::invalid(format!(
                "experiment {experiment_id} does not belong to hackathon {hackathon_id}"
            ));
            return Err(self.abandon(experiment_id, err).await);
        }

        info!(
            experiment_id = %experiment_id,
            hackathon_id = %hackathon_id,
            units = units.len(),
            "starting experiment"
        );

        let result = self.launch(&mut experiment, Direction::Start, units).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abandon(experiment_id, e).await),
        }
    }

    /// Stop every unit of an experiment.
    pub async fn stop(
        &self,
        experiment_id: &ExperimentId,
        units: Vec<UnitDescriptor>,
    ) -> FormationResult<()> {
        let mut experiment = self.load(experiment_id).await?;

        info!(
            experiment_id = %experiment_id,
            units = units.len(),
            "stopping experiment"
        );

        let result = self.launch(&mut experiment, Direction::Stop, units).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.abandon(experiment_id, e).await),
        }
    }

    async fn load(&self, experiment_id: &ExperimentId) -> FormationResult<ExperimentRecord> {
        self.store
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| FormationError::ExperimentNotFound(experiment_id.to_string()))
    }

    async fn launch(
        &self,
        experiment: &mut ExperimentRecord,
        direction: Direction,
        units: Vec<UnitDescriptor>,
    ) -> FormationResult<()> {
        if units.is_empty() {
            return Err(FormationError::invalid("template has no units"));
        }

        let sctx = SuperContext::new(experiment.id.clone(), direction, units);

        match direction {
            Direction::Start => {
                experiment.status = ExperimentStatus::Starting;
                experiment.environments = sctx
                    .job_contexts
                    .iter()
                    .map(|ctx| VirtualEnvironment {
                        name: ctx.resource_name.clone(),
                        provider: ctx.unit.provider(),
                        image: ctx.unit.image().to_owned(),
                        status: EnvironmentStatus::Init,
                    })
                    .collect();
            }
            Direction::Stop => {
                experiment.status = ExperimentStatus::Stopping;
            }
        }
        experiment.error = None;
        self.store.save_experiment(experiment).await?;

        let job = ScheduledJob::new(self.queue.clone(), Step::BeginUnit, sctx);
        self.scheduler.schedule(job, Duration::ZERO).await
    }

    /// Persist `Failed` on a best-effort basis and hand the error back.
    async fn abandon(&self, experiment_id: &ExperimentId, err: FormationError) -> FormationError {
        error!(experiment_id = %experiment_id, error = %err, "experiment request failed");

        if let Err(e) = self
            .store
            .update_status(experiment_id, ExperimentStatus::Failed, Some(&err.to_string()))
            .await
        {
            warn!(experiment_id = %experiment_id, error = %e, "could not record failure");
        }
        err
    }

    async fn set_environment(&self, sctx: &SuperContext, index: usize, status: EnvironmentStatus) {
        let Some(ctx) = sctx.job_contexts.get(index) else {
            return;
        };

        // Stopping only touches environments registered by a previous start.
        let result = self
            .store
            .update_environment_status(&sctx.experiment_id, &ctx.resource_name, status)
            .await;
        match result {
            Ok(()) => {}
            Err(FormationError::InvalidRequest(_)) if sctx.direction == Direction::Stop => {}
            Err(e) => warn!(
                experiment_id = %sctx.experiment_id,
                name = %ctx.resource_name,
                error = %e,
                "could not update environment status"
            ),
        }
    }

    /// Write `Failed` unless a failure is already recorded.
    async fn record_failure(&self, sctx: &SuperContext, reason: &str, status: ExperimentStatus) {
        let current = match self.store.get_experiment(&sctx.experiment_id).await {
            Ok(Some(record)) => record.status,
            Ok(None) => {
                warn!(experiment_id = %sctx.experiment_id, "experiment vanished");
                return;
            }
            Err(e) => {
                warn!(experiment_id = %sctx.experiment_id, error = %e, "could not load experiment");
                return;
            }
        };

        if current == status || (current.is_failure() && status == ExperimentStatus::Failed) {
            return;
        }

        if let Err(e) = self
            .store
            .update_status(&sctx.experiment_id, status, Some(reason))
            .await
        {
            warn!(experiment_id = %sctx.experiment_id, error = %e, "could not record failure");
        }
    }
}

#[async_trait]
impl ProvisionObserver for ExperimentLifecycle {
    async fn unit_succeeded(&self, sctx: &SuperContext, index: usize) {
        let status = match sctx.direction {
            Direction::Start => EnvironmentStatus::Running,
            Direction::Stop => EnvironmentStatus::Stopped,
        };
        self.set_environment(sctx, index, status).await;
    }

    async fn unit_failed(&self, sctx: &SuperContext, index: usize, reason: &str) {
        self.set_environment(sctx, index, EnvironmentStatus::Failed)
            .await;
        self.record_failure(sctx, reason, ExperimentStatus::Failed)
            .await;
    }

    async fn completed(&self, sctx: &SuperContext) {
        if sctx.has_failures() {
            info!(
                experiment_id = %sctx.experiment_id,
                failed = ?sctx.failed_units,
                "experiment finished with failures"
            );
            return;
        }

        let status = match sctx.direction {
            Direction::Start => ExperimentStatus::Running,
            Direction::Stop => ExperimentStatus::Stopped,
        };

        match self.store.get_experiment(&sctx.experiment_id).await {
            Ok(Some(record)) if record.status.is_failure() => {
                warn!(
                    experiment_id = %sctx.experiment_id,
                    status = %record.status,
                    "keeping recorded failure"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(experiment_id = %sctx.experiment_id, error = %e, "could not load experiment");
                return;
            }
        }

        match self
            .store
            .update_status(&sctx.experiment_id, status, None)
            .await
        {
            Ok(()) => info!(experiment_id = %sctx.experiment_id, status = %status, "experiment ready"),
            Err(e) => warn!(
                experiment_id = %sctx.experiment_id,
                error = %e,
                "could not record completion"
            ),
        }
    }

    async fn rolled_back(&self, sctx: &SuperContext, reason: &str) {
        info!(experiment_id = %sctx.experiment_id, "experiment rolled back");
        self.record_failure(sctx, reason, ExperimentStatus::RolledBack)
            .await;
    }

    async fn halted(&self, sctx: &SuperContext, reason: &str) {
        let index = sctx.current_unit_index;
        self.set_environment(sctx, index, EnvironmentStatus::Failed)
            .await;
        self.record_failure(
            sctx,
            &format!("scheduling failed: {reason}"),
            ExperimentStatus::Failed,
        )
        .await;
    }
}

impl std::fmt::Debug for ExperimentLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentLifecycle")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::store::MemoryStore;
    use crate::types::{BackendKey, ServiceUnit};

    fn unit(name: &str) -> UnitDescriptor {
        UnitDescriptor::OrchestratorService(ServiceUnit {
            service_name: name.to_owned(),
            deployment_slot: "ns".to_owned(),
            image_name: "img".to_owned(),
            deployment_spec: "spec".to_owned(),
            backend_key: BackendKey {
                id: "k".to_owned(),
                subscription_id: String::new(),
                certificate_path: String::new(),
                management_host: "host".to_owned(),
            },
        })
    }

    async fn setup() -> (ExperimentLifecycle, Arc<MemoryStore>, Arc<ManualScheduler>, ExperimentId) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let record = ExperimentRecord::new(ExperimentId::new("exp-1"), HackathonId::new("h1"));
        let id = record.id.clone();
        store.insert_experiment(&record).await.unwrap();

        let lifecycle = ExperimentLifecycle::new(store.clone(), scheduler.clone(), "formation");
        (lifecycle, store, scheduler, id)
    }

    #[tokio::test]
    async fn first_failure_is_kept() {
        let (lifecycle, store, _, id) = setup().await;
        lifecycle
            .start(&id, &HackathonId::new("h1"), vec![unit("a"), unit("b")])
            .await
            .unwrap();
        let sctx = SuperContext::new(id.clone(), Direction::Start, vec![unit("a"), unit("b")]);

        lifecycle.unit_failed(&sctx, 0, "first").await;
        lifecycle.unit_failed(&sctx, 1, "second").await;

        let record = store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExperimentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn completion_does_not_override_failure() {
        let (lifecycle, store, _, id) = setup().await;
        store
            .update_status(&id, ExperimentStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let sctx = SuperContext::new(id.clone(), Direction::Start, vec![]);

        lifecycle.completed(&sctx).await;

        let record = store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExperimentStatus::Failed);
    }

    #[tokio::test]
    async fn rollback_replaces_failed() {
        let (lifecycle, store, _, id) = setup().await;
        let sctx = SuperContext::new(id.clone(), Direction::Start, vec![unit("a")]);

        lifecycle.unit_failed(&sctx, 0, "boom").await;
        lifecycle.rolled_back(&sctx, "boom").await;

        let record = store.get_experiment(&id).await.unwrap().unwrap();
        assert_eq!(record.status, ExperimentStatus::RolledBack);
    }
}
