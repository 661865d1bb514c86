//! Common test utilities for formation integration tests.

#![allow(dead_code, clippy::unwrap_used)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use cirrus_formation::adapter::{MockAdapterFactory, MockComputeStack, MockOrchestratorService};
use cirrus_formation::scheduler::{ManualScheduler, Submission};
use cirrus_formation::store::{FormationStore, MemoryStore};
use cirrus_formation::types::{ExperimentId, ExperimentRecord, HackathonId};
use cirrus_formation::{ExperimentLifecycle, FailurePolicy, Orchestrator, OrchestratorSettings};

/// Upper bound on steps before a test is considered stuck.
const MAX_STEPS: usize = 500;

/// Hackathon every test experiment belongs to.
pub const HACKATHON: &str = "hack-1";

/// Poll interval used by the harness.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Orchestrator wired to mocks, driven one step at a time.
pub struct TestHarness {
    pub scheduler: Arc<ManualScheduler>,
    pub compute: Arc<MockComputeStack>,
    pub service: Arc<MockOrchestratorService>,
    pub store: Arc<MemoryStore>,
    pub lifecycle: Arc<ExperimentLifecycle>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// Empty backends, continue-on-failure, bounded polling.
    pub fn new() -> Self {
        Self::with_backends(
            MockComputeStack::new(),
            MockOrchestratorService::new(),
            settings(),
        )
    }

    /// Empty backends with the given failure policy.
    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self::with_backends(
            MockComputeStack::new(),
            MockOrchestratorService::new(),
            OrchestratorSettings {
                failure_policy: policy,
                ..settings()
            },
        )
    }

    /// Empty backends with a re-arm limit per wait state.
    pub fn with_max_poll_attempts(limit: u32) -> Self {
        Self::with_backends(
            MockComputeStack::new(),
            MockOrchestratorService::new(),
            OrchestratorSettings {
                max_poll_attempts: Some(limit),
                ..settings()
            },
        )
    }

    /// Pre-populated backends.
    pub fn with_backends(
        compute: MockComputeStack,
        service: MockOrchestratorService,
        settings: OrchestratorSettings,
    ) -> Self {
        let scheduler = Arc::new(ManualScheduler::new());
        let compute = Arc::new(compute);
        let service = Arc::new(service);
        let store = Arc::new(MemoryStore::new());

        let lifecycle = Arc::new(ExperimentLifecycle::new(
            store.clone(),
            scheduler.clone(),
            settings.queue.clone(),
        ));
        let adapters = Arc::new(MockAdapterFactory::new(compute.clone(), service.clone()));
        let orchestrator = Orchestrator::new(
            scheduler.clone(),
            adapters,
            store.clone(),
            lifecycle.clone(),
            settings,
        );

        Self {
            scheduler,
            compute,
            service,
            store,
            lifecycle,
            orchestrator,
        }
    }

    /// Stores a fresh experiment in the init state.
    pub async fn create_experiment(&self, id: &str) -> ExperimentRecord {
        let record = ExperimentRecord::new(ExperimentId::new(id), HackathonId::new(HACKATHON));
        self.store.insert_experiment(&record).await.unwrap();
        record
    }

    /// Reloads an experiment.
    pub async fn experiment(&self, id: &ExperimentId) -> ExperimentRecord {
        self.store.get_experiment(id).await.unwrap().unwrap()
    }

    /// Runs the next due job, if any.
    pub async fn step(&self) -> Option<Submission> {
        let submission = self.scheduler.pop()?;
        self.orchestrator.advance(submission.job.clone()).await;
        Some(submission)
    }

    /// Runs jobs until nothing is pending and returns how many ran.
    pub async fn run_to_completion(&self) -> usize {
        let mut steps = 0;
        while self.step().await.is_some() {
            steps += 1;
            assert!(steps < MAX_STEPS, "experiment did not settle after {MAX_STEPS} steps");
        }
        steps
    }

    /// Compute-stack calls that create, change or poll something.
    pub fn compute_actions(&self) -> Vec<String> {
        self.compute
            .calls()
            .into_iter()
            .filter(|call| {
                !call.ends_with("_exists")
                    && call != "deployment_name"
                    && call != "assigned_endpoints"
            })
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        queue: "formation".to_owned(),
        poll_interval: POLL_INTERVAL,
        max_poll_attempts: Some(50),
        failure_policy: FailurePolicy::Continue,
    }
}
