//! Steps of the provisioning state machine.
//!
//! Every scheduled job names exactly one [`Step`]. A step handler returns a
//! [`Transition`] telling the orchestrator how to re-arm itself.
//!
//! ```text
//! compute stack, start:
//!
//! SetupCloudService ─▶ SetupStorage ─▶ SetupVirtualMachine
//!                                        │            │           │
//!                          deployment absent   VM absent     VM exists
//!                                        ▼            ▼           │
//!                         WaitCreateDeployment  WaitAddVirtualMachine
//!                                        │            │           │
//!                                        ▼            │           │
//!                          WaitDeploymentReady        │           │
//!                                        │            │           │
//!                                        ▼            ▼           ▼
//!                               WaitInstanceReady ◀── ConfigureNetwork ◀┘
//!                                   │        ▲               │
//!                                   │        └─ WaitConfigureNetwork
//!                                   ▼
//!                                 done
//!
//! orchestrator service, start:
//!
//! EnsureServiceDeployment ─▶ StartService ─▶ WaitServiceRunning ─▶ done
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::Direction;
use crate::types::Provider;

/// A single resumable step of unit provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Start the unit under the cursor, or finish the experiment.
    BeginUnit,

    /// Create the cloud service if it does not exist.
    SetupCloudService,
    /// Create the storage account if it does not exist.
    SetupStorage,
    /// Create the deployment or add the VM to an existing one.
    SetupVirtualMachine,
    /// Poll the add-VM operation.
    WaitAddVirtualMachine,
    /// Poll the create-deployment operation.
    WaitCreateDeployment,
    /// Poll until the deployment is running.
    WaitDeploymentReady,
    /// Poll until the VM instance is ready.
    WaitInstanceReady,
    /// Push the endpoint configuration to the VM.
    ConfigureNetwork,
    /// Poll the network update operation.
    WaitConfigureNetwork,
    /// Issue a stop for the VM.
    StopVirtualMachine,
    /// Poll the stop operation.
    WaitStopVirtualMachine,
    /// Poll until the VM instance reports stopped.
    WaitInstanceStopped,

    /// Create the service deployment from its spec if absent.
    EnsureServiceDeployment,
    /// Start the service.
    StartService,
    /// Poll until the service is running.
    WaitServiceRunning,
    /// Stop the service.
    StopService,
    /// Poll until the service is stopped.
    WaitServiceStopped,
}

impl Step {
    /// First step of a unit for the given backend and direction.
    #[must_use]
    pub const fn entry(provider: Provider, direction: Direction) -> Self {
        match (provider, direction) {
            (Provider::ComputeStack, Direction::Start) => Self::SetupCloudService,
            (Provider::ComputeStack, Direction::Stop) => Self::StopVirtualMachine,
            (Provider::OrchestratorService, Direction::Start) => Self::EnsureServiceDeployment,
            (Provider::OrchestratorService, Direction::Stop) => Self::StopService,
        }
    }

    /// Get the step name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BeginUnit => "begin_unit",
            Self::SetupCloudService => "setup_cloud_service",
            Self::SetupStorage => "setup_storage",
            Self::SetupVirtualMachine => "setup_virtual_machine",
            Self::WaitAddVirtualMachine => "wait_add_virtual_machine",
            Self::WaitCreateDeployment => "wait_create_deployment",
            Self::WaitDeploymentReady => "wait_deployment_ready",
            Self::WaitInstanceReady => "wait_instance_ready",
            Self::ConfigureNetwork => "configure_network",
            Self::WaitConfigureNetwork => "wait_configure_network",
            Self::StopVirtualMachine => "stop_virtual_machine",
            Self::WaitStopVirtualMachine => "wait_stop_virtual_machine",
            Self::WaitInstanceStopped => "wait_instance_stopped",
            Self::EnsureServiceDeployment => "ensure_service_deployment",
            Self::StartService => "start_service",
            Self::WaitServiceRunning => "wait_service_running",
            Self::StopService => "stop_service",
            Self::WaitServiceStopped => "wait_service_stopped",
        }
    }

    /// Whether the step polls the backend rather than issuing a request.
    #[must_use]
    pub const fn is_wait(&self) -> bool {
        matches!(
            self,
            Self::WaitAddVirtualMachine
                | Self::WaitCreateDeployment
                | Self::WaitDeploymentReady
                | Self::WaitInstanceReady
                | Self::WaitConfigureNetwork
                | Self::WaitStopVirtualMachine
                | Self::WaitInstanceStopped
                | Self::WaitServiceRunning
                | Self::WaitServiceStopped
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Run the given step straight away.
    Next(Step),
    /// Run the given step after the poll interval.
    Poll(Step),
    /// The unit reached its goal.
    Done,
    /// The unit failed.
    Fail(String),
}

impl Transition {
    /// Build a failure transition.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn entry_steps_per_backend() {
        assert_eq!(
            Step::entry(Provider::ComputeStack, Direction::Start),
            Step::SetupCloudService
        );
        assert_eq!(
            Step::entry(Provider::OrchestratorService, Direction::Stop),
            Step::StopService
        );
    }

    #[test]
    fn wait_steps_are_flagged() {
        assert!(Step::WaitInstanceReady.is_wait());
        assert!(Step::WaitServiceStopped.is_wait());
        assert!(Step::WaitInstanceStopped.is_wait());
        assert!(!Step::ConfigureNetwork.is_wait());
        assert!(!Step::BeginUnit.is_wait());
    }

    #[test]
    fn step_serialises_as_snake_case() {
        let json = serde_json::to_string(&Step::WaitCreateDeployment).unwrap();
        assert_eq!(json, r#""wait_create_deployment""#);
    }
}
