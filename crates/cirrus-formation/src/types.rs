//! Core types for cirrus-formation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Create a new experiment ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique experiment ID using ULID.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ExperimentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of the hackathon an experiment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HackathonId(String);

impl HackathonId {
    /// Create a new hackathon ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HackathonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created, nothing scheduled yet.
    Init,
    /// Environments are being provisioned.
    Starting,
    /// Every environment is up.
    Running,
    /// Environments are being stopped.
    Stopping,
    /// Every environment is stopped.
    Stopped,
    /// At least one unit failed.
    Failed,
    /// A failed unit's resources were removed and the experiment aborted.
    RolledBack,
}

impl ExperimentStatus {
    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Whether the status records a failure that must not be overwritten.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::RolledBack)
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(format!("unknown experiment status: {s}")),
        }
    }
}

/// Status of a single virtual environment within an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Registered but not provisioned yet.
    Init,
    /// Provisioned and ready.
    Running,
    /// Stopped.
    Stopped,
    /// Provisioning or stopping failed.
    Failed,
}

/// Which backend a unit is provisioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Cloud service + storage account + virtual machine.
    ComputeStack,
    /// Container-orchestrator deployment.
    OrchestratorService,
}

impl Provider {
    /// Get the provider name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ComputeStack => "compute_stack",
            Self::OrchestratorService => "orchestrator_service",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One environment owned by an experiment, one per template unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEnvironment {
    /// Resolved resource name (VM or service name).
    pub name: String,
    /// Backend the environment lives on.
    pub provider: Provider,
    /// Image the environment boots from.
    pub image: String,
    /// Current status.
    pub status: EnvironmentStatus,
}

/// An experiment record as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRecord {
    /// Unique experiment identifier.
    pub id: ExperimentId,
    /// Hackathon the experiment belongs to.
    pub hackathon_id: HackathonId,
    /// Current status.
    pub status: ExperimentStatus,
    /// Environments provisioned for this experiment.
    #[serde(default)]
    pub environments: Vec<VirtualEnvironment>,
    /// When the experiment was created.
    pub created_at: DateTime<Utc>,
    /// When the experiment was last updated.
    pub updated_at: DateTime<Utc>,
    /// Error message if the experiment failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExperimentRecord {
    /// Create a new experiment record in the init state.
    #[must_use]
    pub fn new(id: ExperimentId, hackathon_id: HackathonId) -> Self {
        let now = Utc::now();
        Self {
            id,
            hackathon_id,
            status: ExperimentStatus::Init,
            environments: Vec::new(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Find an environment by name.
    #[must_use]
    pub fn environment(&self, name: &str) -> Option<&VirtualEnvironment> {
        self.environments.iter().find(|e| e.name == name)
    }
}

/// Credentials used to reach a backend control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendKey {
    /// Identifier of the stored key.
    pub id: String,
    /// Subscription the resources are billed to.
    #[serde(default)]
    pub subscription_id: String,
    /// Path to the management certificate.
    #[serde(default)]
    pub certificate_path: String,
    /// Management API host.
    pub management_host: String,
}

/// An input endpoint requested by a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEndpoint {
    /// Endpoint name (e.g. "ssh", "http").
    pub name: String,
    /// Transport protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port inside the VM.
    pub local_port: u16,
    /// Requested public port; assigned automatically when absent.
    #[serde(default)]
    pub public_port: Option<u16>,
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

/// Network configuration as written in the template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNetworkConfig {
    /// Subnet names the VM joins.
    #[serde(default)]
    pub subnets: Vec<String>,
    /// Input endpoints to expose.
    #[serde(default)]
    pub input_endpoints: Vec<InputEndpoint>,
}

/// Template unit for the compute-stack backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeUnit {
    /// Cloud service grouping the VM.
    pub cloud_service_name: String,
    /// Cloud service label.
    pub cloud_service_label: String,
    /// Cloud service location.
    pub cloud_service_location: String,
    /// Storage account backing the VM disks.
    pub storage_account_name: String,
    /// Storage account description.
    #[serde(default)]
    pub storage_account_description: String,
    /// Storage account label.
    pub storage_account_label: String,
    /// Storage account location.
    pub storage_account_location: String,
    /// Base VM name; the experiment suffix is appended.
    pub virtual_machine_name: String,
    /// VM label.
    pub virtual_machine_label: String,
    /// VM role size.
    pub virtual_machine_size: String,
    /// Deployment name used when the deployment has to be created.
    pub deployment_name: String,
    /// Deployment slot (e.g. "production", "staging").
    pub deployment_slot: String,
    /// Image name the VM boots from.
    pub vm_image_name: String,
    /// Whether the image is a captured VM image rather than an OS disk image.
    #[serde(default)]
    pub is_vm_image: bool,
    /// Opaque system configuration passed through to the backend.
    #[serde(default)]
    pub system_config: serde_json::Value,
    /// Opaque OS disk configuration passed through to the backend.
    #[serde(default)]
    pub os_virtual_hard_disk: serde_json::Value,
    /// Template network configuration.
    #[serde(default)]
    pub network_config: RawNetworkConfig,
    /// Credentials for the backend.
    pub backend_key: BackendKey,
}

/// Template unit for the orchestrator-service backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUnit {
    /// Base service name; the experiment suffix is appended.
    pub service_name: String,
    /// Deployment slot (namespace).
    pub deployment_slot: String,
    /// Image the service runs.
    pub image_name: String,
    /// Deployment specification handed to the orchestrator as-is.
    pub deployment_spec: String,
    /// Credentials for the backend.
    pub backend_key: BackendKey,
}

/// One resource unit requested by an experiment template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum UnitDescriptor {
    /// Unit provisioned on the compute stack.
    ComputeStack(ComputeUnit),
    /// Unit provisioned on the orchestrator service.
    OrchestratorService(ServiceUnit),
}

impl UnitDescriptor {
    /// Backend this unit targets.
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::ComputeStack(_) => Provider::ComputeStack,
            Self::OrchestratorService(_) => Provider::OrchestratorService,
        }
    }

    /// Base name of the unit's primary resource.
    #[must_use]
    pub fn base_name(&self) -> &str {
        match self {
            Self::ComputeStack(unit) => &unit.virtual_machine_name,
            Self::OrchestratorService(unit) => &unit.service_name,
        }
    }

    /// Image the unit boots from.
    #[must_use]
    pub fn image(&self) -> &str {
        match self {
            Self::ComputeStack(unit) => &unit.vm_image_name,
            Self::OrchestratorService(unit) => &unit.image_name,
        }
    }

    /// Credentials for the unit's backend.
    #[must_use]
    pub const fn backend_key(&self) -> &BackendKey {
        match self {
            Self::ComputeStack(unit) => &unit.backend_key,
            Self::OrchestratorService(unit) => &unit.backend_key,
        }
    }
}

/// Build the concrete resource name for a unit within an experiment.
#[must_use]
pub fn resource_name(base: &str, suffix: &str) -> String {
    format!("{base}-{suffix}")
}

/// Kind of mirrored backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Cloud service grouping resource.
    CloudService,
    /// Storage account.
    StorageAccount,
}

impl ResourceKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CloudService => "cloud_service",
            Self::StorageAccount => "storage_account",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud_service" => Ok(Self::CloudService),
            "storage_account" => Ok(Self::StorageAccount),
            _ => Err(format!("unknown resource kind: {s}")),
        }
    }
}

/// A backend resource mirrored into the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name (unique per kind on the backend).
    pub name: String,
    /// Display label.
    pub label: String,
    /// Description, storage accounts only.
    #[serde(default)]
    pub description: String,
    /// Location the resource lives in.
    pub location: String,
    /// Backend status when the row was written ("created", "online").
    pub status: String,
    /// Key used to create the resource.
    pub backend_key_id: String,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}
