//! Orchestrator-service pipeline: a container deployment started from a spec.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::Pipeline;
use crate::adapter::{OrchestratorServiceAdapter, ServiceStatus};
use crate::context::{Direction, JobContext, UndoAction};
use crate::error::{FormationError, FormationResult};
use crate::step::{Step, Transition};
use crate::types::{Provider, ServiceUnit, UnitDescriptor};

/// Creates the deployment if absent, starts it and waits for it to run.
pub struct OrchestratorServicePipeline {
    adapter: Arc<dyn OrchestratorServiceAdapter>,
}

impl OrchestratorServicePipeline {
    /// Create a pipeline over an adapter.
    pub fn new(adapter: Arc<dyn OrchestratorServiceAdapter>) -> Self {
        Self { adapter }
    }

    async fn ensure_deployment(
        &self,
        unit: &ServiceUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let name = &ctx.resource_name;
        let slot = &unit.deployment_slot;

        if self.adapter.deployment_exists(name, slot).await? {
            info!(service = %name, slot = %slot, "service deployment exists");
            return Ok(Transition::Next(Step::StartService));
        }

        if !self
            .adapter
            .create_deployment_from_spec(name, slot, &unit.deployment_spec)
            .await?
        {
            return Ok(Transition::fail(format!(
                "service deployment {name} was not created"
            )));
        }

        ctx.undo.push(UndoAction::DeleteServiceDeployment {
            name: name.clone(),
            slot: slot.clone(),
        });
        info!(service = %ctx.resource_name, slot = %slot, "service deployment created");
        Ok(Transition::Next(Step::StartService))
    }

    async fn start(&self, ctx: &JobContext) -> FormationResult<Transition> {
        if !self.adapter.start(&ctx.resource_name).await? {
            return Ok(Transition::fail(format!(
                "service {} did not start",
                ctx.resource_name
            )));
        }
        Ok(Transition::Poll(Step::WaitServiceRunning))
    }

    async fn stop(&self, unit: &ServiceUnit, ctx: &JobContext) -> FormationResult<Transition> {
        let name = &ctx.resource_name;
        if !self
            .adapter
            .deployment_exists(name, &unit.deployment_slot)
            .await?
        {
            info!(service = %name, "no service deployment, nothing to stop");
            return Ok(Transition::Done);
        }

        if !self.adapter.stop(name).await? {
            return Ok(Transition::fail(format!("service {name} did not stop")));
        }
        Ok(Transition::Poll(Step::WaitServiceStopped))
    }

    /// Poll the service until it reports `target`.
    async fn wait_for(
        &self,
        ctx: &JobContext,
        current: Step,
        target: &ServiceStatus,
    ) -> FormationResult<Transition> {
        let name = &ctx.resource_name;
        let status = self.adapter.service_status(name).await?;

        Ok(match status {
            None => Transition::fail(format!("status of service {name} is unknown")),
            Some(ServiceStatus::Failed(reason)) => {
                Transition::fail(format!("service {name} failed: {reason}"))
            }
            Some(ref status) if status == target => Transition::Done,
            Some(_) => Transition::Poll(current),
        })
    }
}

fn service_unit(ctx: &JobContext) -> FormationResult<ServiceUnit> {
    match &ctx.unit {
        UnitDescriptor::OrchestratorService(unit) => Ok(unit.clone()),
        UnitDescriptor::ComputeStack(_) => Err(FormationError::internal(
            "compute stack unit routed to the orchestrator service pipeline",
        )),
    }
}

#[async_trait]
impl Pipeline for OrchestratorServicePipeline {
    fn name(&self) -> &'static str {
        Provider::OrchestratorService.as_str()
    }

    fn entry_step(&self, direction: Direction) -> Step {
        Step::entry(Provider::OrchestratorService, direction)
    }

    async fn run(&self, step: Step, ctx: &mut JobContext) -> FormationResult<Transition> {
        let unit = service_unit(ctx)?;

        match step {
            Step::EnsureServiceDeployment => self.ensure_deployment(&unit, ctx).await,
            Step::StartService => self.start(ctx).await,
            Step::WaitServiceRunning => self.wait_for(ctx, step, &ServiceStatus::Running).await,
            Step::StopService => self.stop(&unit, ctx).await,
            Step::WaitServiceStopped => self.wait_for(ctx, step, &ServiceStatus::Stopped).await,
            other => Err(FormationError::internal(format!(
                "{other} is not an orchestrator service step"
            ))),
        }
    }

    async fn undo(&self, action: &UndoAction) -> FormationResult<()> {
        match action {
            UndoAction::DeleteServiceDeployment { name, slot } => {
                self.adapter.delete_deployment(name, slot).await
            }
            other => Err(FormationError::internal(format!(
                "{other:?} routed to the orchestrator service pipeline"
            ))),
        }
    }
}
