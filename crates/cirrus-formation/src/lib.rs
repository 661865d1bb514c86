//! Cirrus Formation
//!
//! Asynchronous provisioning of experiment environments. An experiment is
//! built from a template made of ordered units; each unit is either a
//! compute stack (cloud service, storage account and virtual machine) or a
//! container deployment on an orchestrator service.
//!
//! # Architecture
//!
//! - **Lifecycle**: [`ExperimentLifecycle`] validates start and stop
//!   requests, records statuses and submits the first job.
//! - **Orchestrator**: [`Orchestrator`] runs one step per scheduled job and
//!   re-arms the experiment, with zero delay or after the poll interval.
//! - **Pipelines**: one state machine per backend kind, behind the
//!   [`Pipeline`](orchestrator::Pipeline) trait.
//! - **Adapters**: backend control planes behind
//!   [`ComputeStackAdapter`] and [`OrchestratorServiceAdapter`].
//! - **Scheduler**: [`DeferredScheduler`] delivers a job after a delay. Each
//!   experiment holds a single job id per direction.
//! - **Store**: experiment records and a mirror of created backend resources.
//!
//! # Unit progression
//!
//! ```text
//! unit 0: setup ──▶ wait ──▶ ... ──▶ done ─┐
//!                                          ▼
//! unit 1: setup ──▶ wait ──▶ ... ──▶ done ─┐
//!                                          ▼
//!                                      completed
//! ```
//!
//! Units never overlap: unit `k + 1` starts only after unit `k` succeeded or
//! failed.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod service;
pub mod step;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use adapter::{
    create_adapter_factory, AdapterFactory, ComputeStackAdapter, OrchestratorServiceAdapter,
};
pub use config::FormationConfig;
pub use context::{Direction, JobContext, SuperContext, UndoAction, UnitOutcome};
pub use error::{FormationError, FormationResult};
pub use lifecycle::ExperimentLifecycle;
pub use orchestrator::{Orchestrator, OrchestratorSettings, ProvisionObserver};
pub use policy::FailurePolicy;
pub use scheduler::{DeferredScheduler, JobId, ManualScheduler, ScheduledJob, TokioScheduler};
pub use service::FormationService;
pub use step::{Step, Transition};
pub use store::{FormationStore, MemoryStore, PostgresStore, ResourceFilter};
pub use types::{
    ExperimentId, ExperimentRecord, ExperimentStatus, HackathonId, Provider, UnitDescriptor,
};
