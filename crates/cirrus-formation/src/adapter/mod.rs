//! Backend adapters for the remote control planes.
//!
//! An adapter wraps one management API. Two capabilities exist: the compute
//! stack (cloud service, storage account, virtual machine) and the
//! orchestrator service (a container deployment started from a spec).
//! Adapters are derived from a [`BackendKey`] through an [`AdapterFactory`],
//! so the orchestrator never touches credentials directly.
//!
//! Every adapter method returns `FormationError::BackendUnavailable` when the
//! control plane cannot be reached and `FormationError::BackendRejected` when
//! it refuses a request. Creation methods that report `Ok(false)` were
//! accepted by the transport but not carried out.

pub mod mock;

pub use mock::{MockAdapterFactory, MockComputeStack, MockOrchestratorService};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{AdapterType, BackendConfig};
use crate::error::FormationResult;
use crate::network::NetworkConfig;
use crate::types::BackendKey;

/// Handle to an asynchronous operation accepted by the compute stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(String);

impl OperationHandle {
    /// Wrap a backend request id.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self(request_id.into())
    }

    /// Get the request id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an asynchronous compute-stack operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running.
    Pending,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed {
        /// Error reported by the backend.
        error: String,
    },
}

/// Status of a VM deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    /// The deployment is running.
    Running,
    /// The deployment is starting.
    Starting,
    /// The deployment is suspended.
    Suspended,
    /// Any other backend-specific status.
    Other(String),
}

/// Status of a VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    /// The role is ready.
    Ready,
    /// The role is still booting.
    Starting,
    /// The role is stopped.
    Stopped,
    /// The role reported an error.
    Failed(String),
}

/// Status of an orchestrator service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Scheduled but not running yet.
    Pending,
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// The service reported an error.
    Failed(String),
}

/// Parameters for creating or adding a virtual machine.
#[derive(Debug, Clone)]
pub struct VirtualMachineRequest {
    /// Cloud service holding the deployment.
    pub service_name: String,
    /// Deployment the VM belongs to.
    pub deployment_name: String,
    /// Deployment slot.
    pub deployment_slot: String,
    /// Deployment label, used when the deployment is created.
    pub label: String,
    /// Concrete VM name.
    pub vm_name: String,
    /// Opaque system configuration.
    pub system_config: serde_json::Value,
    /// Opaque OS disk configuration.
    pub os_virtual_hard_disk: serde_json::Value,
    /// Endpoint configuration.
    pub network_config: NetworkConfig,
    /// VM role size.
    pub role_size: String,
    /// Image the VM boots from.
    pub vm_image_name: String,
}

/// Management API of the compute-stack backend.
#[async_trait]
pub trait ComputeStackAdapter: Send + Sync {
    /// Check whether a cloud service exists.
    async fn cloud_service_exists(&self, name: &str) -> FormationResult<bool>;

    /// Create a cloud service.
    async fn create_cloud_service(
        &self,
        name: &str,
        label: &str,
        location: &str,
    ) -> FormationResult<bool>;

    /// Delete a cloud service.
    async fn delete_cloud_service(&self, name: &str) -> FormationResult<()>;

    /// Check whether a storage account exists.
    async fn storage_account_exists(&self, name: &str) -> FormationResult<bool>;

    /// Create a storage account.
    async fn create_storage_account(
        &self,
        name: &str,
        description: &str,
        label: &str,
        location: &str,
    ) -> FormationResult<bool>;

    /// Delete a storage account.
    async fn delete_storage_account(&self, name: &str) -> FormationResult<()>;

    /// Check whether a deployment exists in the given slot.
    async fn deployment_exists(&self, service: &str, slot: &str) -> FormationResult<bool>;

    /// Name of the deployment in the given slot, if any.
    async fn deployment_name(&self, service: &str, slot: &str) -> FormationResult<Option<String>>;

    /// Check whether a VM exists in a deployment.
    async fn virtual_machine_exists(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
    ) -> FormationResult<bool>;

    /// Create a deployment holding a first VM.
    async fn create_virtual_machine_deployment(
        &self,
        request: &VirtualMachineRequest,
    ) -> FormationResult<OperationHandle>;

    /// Add a VM to an existing deployment.
    async fn add_virtual_machine(
        &self,
        request: &VirtualMachineRequest,
    ) -> FormationResult<OperationHandle>;

    /// Replace the endpoint configuration of a VM.
    async fn update_network_config(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
        network: &NetworkConfig,
    ) -> FormationResult<OperationHandle>;

    /// Stop a VM.
    async fn stop_virtual_machine(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
    ) -> FormationResult<OperationHandle>;

    /// Remove a VM from its deployment.
    async fn delete_virtual_machine(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
    ) -> FormationResult<OperationHandle>;

    /// Delete a deployment.
    async fn delete_deployment(
        &self,
        service: &str,
        deployment: &str,
    ) -> FormationResult<OperationHandle>;

    /// Poll an asynchronous operation.
    async fn get_operation_status(
        &self,
        handle: &OperationHandle,
    ) -> FormationResult<OperationStatus>;

    /// Status of the deployment in the given slot, `None` when absent.
    async fn get_deployment_status(
        &self,
        service: &str,
        slot: &str,
    ) -> FormationResult<Option<DeploymentStatus>>;

    /// Status of a VM instance, `None` when absent.
    async fn get_instance_status(
        &self,
        service: &str,
        slot: &str,
        vm_name: &str,
    ) -> FormationResult<Option<InstanceStatus>>;

    /// Public ports already taken in a cloud service.
    async fn assigned_endpoints(&self, service: &str) -> FormationResult<Vec<u16>>;
}

/// Management API of the orchestrator-service backend.
#[async_trait]
pub trait OrchestratorServiceAdapter: Send + Sync {
    /// Check whether a deployment exists.
    async fn deployment_exists(&self, name: &str, slot: &str) -> FormationResult<bool>;

    /// Create a deployment from an opaque spec.
    async fn create_deployment_from_spec(
        &self,
        name: &str,
        slot: &str,
        spec: &str,
    ) -> FormationResult<bool>;

    /// Start a service.
    async fn start(&self, name: &str) -> FormationResult<bool>;

    /// Stop a service.
    async fn stop(&self, name: &str) -> FormationResult<bool>;

    /// Current status of a service, `None` when it is unknown.
    async fn service_status(&self, name: &str) -> FormationResult<Option<ServiceStatus>>;

    /// Delete a deployment.
    async fn delete_deployment(&self, name: &str, slot: &str) -> FormationResult<()>;
}

/// Builds adapters for a backend key.
pub trait AdapterFactory: Send + Sync {
    /// Adapter for the compute-stack backend.
    fn compute_stack(&self, key: &BackendKey) -> FormationResult<Arc<dyn ComputeStackAdapter>>;

    /// Adapter for the orchestrator-service backend.
    fn orchestrator_service(
        &self,
        key: &BackendKey,
    ) -> FormationResult<Arc<dyn OrchestratorServiceAdapter>>;
}

/// Create an adapter factory from configuration.
#[must_use]
pub fn create_adapter_factory(config: &BackendConfig) -> Arc<dyn AdapterFactory> {
    match config.adapter_type {
        AdapterType::Mock => Arc::new(MockAdapterFactory::default()),
    }
}
