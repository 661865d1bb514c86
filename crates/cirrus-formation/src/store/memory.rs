//! In-memory store for testing and local runs.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{FormationError, FormationResult};
use crate::types::{
    EnvironmentStatus, ExperimentId, ExperimentRecord, ExperimentStatus, ResourceRecord,
};

use super::{FormationStore, ResourceFilter};

/// In-memory experiment store.
///
/// Data is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    experiments: RwLock<HashMap<String, ExperimentRecord>>,
    resources: RwLock<Vec<ResourceRecord>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FormationStore for MemoryStore {
    async fn insert_experiment(&self, record: &ExperimentRecord) -> FormationResult<()> {
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let key = record.id.as_str().to_owned();
        if experiments.contains_key(&key) {
            return Err(FormationError::internal(format!(
                "experiment {key} already exists"
            )));
        }

        experiments.insert(key, record.clone());
        Ok(())
    }

    async fn get_experiment(&self, id: &ExperimentId) -> FormationResult<Option<ExperimentRecord>> {
        let experiments = self
            .experiments
            .read()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        Ok(experiments.get(id.as_str()).cloned())
    }

    async fn save_experiment(&self, record: &ExperimentRecord) -> FormationResult<()> {
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let stored = experiments
            .get_mut(record.id.as_str())
            .ok_or_else(|| FormationError::ExperimentNotFound(record.id.to_string()))?;

        stored.status = record.status;
        stored.environments.clone_from(&record.environments);
        stored.error.clone_from(&record.error);
        stored.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_status(
        &self,
        id: &ExperimentId,
        status: ExperimentStatus,
        error: Option<&str>,
    ) -> FormationResult<()> {
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let record = experiments
            .get_mut(id.as_str())
            .ok_or_else(|| FormationError::ExperimentNotFound(id.to_string()))?;

        record.status = status;
        record.error = error.map(ToOwned::to_owned);
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn update_environment_status(
        &self,
        id: &ExperimentId,
        name: &str,
        status: EnvironmentStatus,
    ) -> FormationResult<()> {
        let mut experiments = self
            .experiments
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let record = experiments
            .get_mut(id.as_str())
            .ok_or_else(|| FormationError::ExperimentNotFound(id.to_string()))?;

        let environment = record
            .environments
            .iter_mut()
            .find(|e| e.name == name)
            .ok_or_else(|| {
                FormationError::invalid(format!("experiment {id} has no environment {name}"))
            })?;

        environment.status = status;
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn count_resources(&self, filter: &ResourceFilter) -> FormationResult<u64> {
        let resources = self
            .resources
            .read()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let count = resources.iter().filter(|r| filter.matches(r)).count();
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    async fn delete_resources(&self, filter: &ResourceFilter) -> FormationResult<u64> {
        let mut resources = self
            .resources
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let before = resources.len();
        resources.retain(|r| !filter.matches(r));
        let removed = before - resources.len();
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    async fn insert_resource(&self, record: &ResourceRecord) -> FormationResult<()> {
        let mut resources = self
            .resources
            .write()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        resources.push(record.clone());
        Ok(())
    }

    async fn list_resources(&self, filter: &ResourceFilter) -> FormationResult<Vec<ResourceRecord>> {
        let resources = self
            .resources
            .read()
            .map_err(|_| FormationError::internal("lock poisoned"))?;

        let mut results: Vec<_> = resources
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }
}
