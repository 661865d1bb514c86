//! Experiment and resource persistence.
//!
//! Experiments carry their environment list inline. Compute-stack resources
//! (cloud services, storage accounts) are mirrored into a separate table so
//! the platform can list them without asking the backend; the backend stays
//! the source of truth for whether a resource exists.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::FormationResult;
use crate::types::{
    EnvironmentStatus, ExperimentId, ExperimentRecord, ExperimentStatus, ResourceKind,
    ResourceRecord,
};

/// Filter criteria for mirrored resources.
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Filter by resource name.
    pub name: Option<String>,
    /// Filter by the key the resource was created with.
    pub backend_key_id: Option<String>,
}

impl ResourceFilter {
    /// Match every resource of a kind.
    #[must_use]
    pub const fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            name: None,
            backend_key_id: None,
        }
    }

    /// Filter by name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Filter by backend key.
    #[must_use]
    pub fn with_backend_key(mut self, key_id: impl Into<String>) -> Self {
        self.backend_key_id = Some(key_id.into());
        self
    }

    /// Whether a record matches the filter.
    #[must_use]
    pub fn matches(&self, record: &ResourceRecord) -> bool {
        record.kind == self.kind
            && self.name.as_ref().map_or(true, |n| &record.name == n)
            && self
                .backend_key_id
                .as_ref()
                .map_or(true, |k| &record.backend_key_id == k)
    }
}

/// Backend for experiment records and mirrored resources.
#[async_trait]
pub trait FormationStore: Send + Sync {
    /// Insert a new experiment.
    ///
    /// Returns an error if an experiment with the same ID already exists.
    async fn insert_experiment(&self, record: &ExperimentRecord) -> FormationResult<()>;

    /// Get an experiment by ID.
    async fn get_experiment(&self, id: &ExperimentId) -> FormationResult<Option<ExperimentRecord>>;

    /// Overwrite status, environments and error of an existing experiment.
    async fn save_experiment(&self, record: &ExperimentRecord) -> FormationResult<()>;

    /// Update an experiment's status.
    ///
    /// Also refreshes `updated_at`. The error message is replaced, not merged.
    async fn update_status(
        &self,
        id: &ExperimentId,
        status: ExperimentStatus,
        error: Option<&str>,
    ) -> FormationResult<()>;

    /// Update the status of one environment of an experiment.
    async fn update_environment_status(
        &self,
        id: &ExperimentId,
        name: &str,
        status: EnvironmentStatus,
    ) -> FormationResult<()>;

    /// Count mirrored resources matching the filter.
    async fn count_resources(&self, filter: &ResourceFilter) -> FormationResult<u64>;

    /// Delete mirrored resources matching the filter, returning how many went.
    async fn delete_resources(&self, filter: &ResourceFilter) -> FormationResult<u64>;

    /// Insert a mirrored resource row.
    async fn insert_resource(&self, record: &ResourceRecord) -> FormationResult<()>;

    /// List mirrored resources matching the filter, oldest first.
    async fn list_resources(&self, filter: &ResourceFilter) -> FormationResult<Vec<ResourceRecord>>;
}
