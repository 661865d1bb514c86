//! Job contexts carried between scheduled steps.
//!
//! A [`SuperContext`] is the only payload handed to the deferred scheduler.
//! It owns one [`JobContext`] per template unit, in template order, and a
//! cursor pointing at the unit currently being provisioned. Steps look up
//! their unit through the cursor, mutate it in place and re-submit the whole
//! envelope.

use serde::{Deserialize, Serialize};

use crate::adapter::OperationHandle;
use crate::types::{resource_name, ExperimentId, UnitDescriptor};

/// Length of the experiment-id suffix appended to resource names.
const RESOURCE_SUFFIX_LEN: usize = 8;

/// Whether an experiment is being brought up or torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Provision every unit.
    Start,
    /// Stop every unit.
    Stop,
}

impl Direction {
    /// Get the direction name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Compensating action recorded once a creation succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UndoAction {
    /// Delete a cloud service created for the unit.
    DeleteCloudService {
        /// Cloud service name.
        name: String,
    },
    /// Delete a storage account created for the unit.
    DeleteStorageAccount {
        /// Storage account name.
        name: String,
    },
    /// Delete a VM deployment created for the unit.
    DeleteDeployment {
        /// Cloud service holding the deployment.
        service: String,
        /// Deployment name.
        deployment: String,
    },
    /// Remove a VM added to an existing deployment.
    DeleteVirtualMachine {
        /// Cloud service holding the deployment.
        service: String,
        /// Deployment name.
        deployment: String,
        /// VM name.
        vm_name: String,
    },
    /// Delete an orchestrator deployment created for the unit.
    DeleteServiceDeployment {
        /// Service name.
        name: String,
        /// Deployment slot.
        slot: String,
    },
}

/// Terminal outcome of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// The unit reached its goal.
    Succeeded,
    /// The unit failed.
    Failed {
        /// Why it failed.
        reason: String,
    },
}

/// Per-unit state carried across suspension points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    /// The template unit, copied in.
    pub unit: UnitDescriptor,
    /// Concrete VM or service name for this experiment.
    pub resource_name: String,
    /// Deployment the VM lives in, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    /// Backend operation currently in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationHandle>,
    /// Whether endpoints still have to be configured after creation.
    #[serde(default)]
    pub needs_config: bool,
    /// Number of re-arms spent in the current wait state.
    #[serde(default)]
    pub attempts: u32,
    /// Compensating actions, most recent last.
    #[serde(default)]
    pub undo: Vec<UndoAction>,
    /// Set once the unit terminates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<UnitOutcome>,
}

impl JobContext {
    /// Create the context for one unit.
    #[must_use]
    pub fn new(unit: UnitDescriptor, suffix: &str) -> Self {
        let resource_name = resource_name(unit.base_name(), suffix);
        Self {
            unit,
            resource_name,
            deployment_name: None,
            operation: None,
            needs_config: false,
            attempts: 0,
            undo: Vec::new(),
            outcome: None,
        }
    }
}

/// Envelope re-submitted to the scheduler on every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperContext {
    /// Experiment being provisioned.
    pub experiment_id: ExperimentId,
    /// Start or stop.
    pub direction: Direction,
    /// Suffix appended to every resource name of this experiment.
    pub resource_suffix: String,
    /// One context per unit, in provisioning order.
    pub job_contexts: Vec<JobContext>,
    /// Index of the unit being provisioned; equals the length once done.
    pub current_unit_index: usize,
    /// Indices of units that failed.
    #[serde(default)]
    pub failed_units: Vec<usize>,
}

impl SuperContext {
    /// Build the envelope for an experiment, preserving template order.
    #[must_use]
    pub fn new(
        experiment_id: ExperimentId,
        direction: Direction,
        units: Vec<UnitDescriptor>,
    ) -> Self {
        let resource_suffix = resource_suffix(&experiment_id);
        let job_contexts = units
            .into_iter()
            .map(|unit| JobContext::new(unit, &resource_suffix))
            .collect();

        Self {
            experiment_id,
            direction,
            resource_suffix,
            job_contexts,
            current_unit_index: 0,
            failed_units: Vec::new(),
        }
    }

    /// Context of the unit under the cursor.
    #[must_use]
    pub fn current(&self) -> Option<&JobContext> {
        self.job_contexts.get(self.current_unit_index)
    }

    /// Mutable context of the unit under the cursor.
    pub fn current_mut(&mut self) -> Option<&mut JobContext> {
        self.job_contexts.get_mut(self.current_unit_index)
    }

    /// Whether every unit has been processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.current_unit_index >= self.job_contexts.len()
    }

    /// Move the cursor to the next unit.
    pub fn advance_cursor(&mut self) {
        if !self.is_complete() {
            self.current_unit_index += 1;
        }
    }

    /// Skip every remaining unit.
    pub fn abort(&mut self) {
        self.current_unit_index = self.job_contexts.len();
    }

    /// Whether any unit failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed_units.is_empty()
    }
}

fn resource_suffix(experiment_id: &ExperimentId) -> String {
    let id = experiment_id.as_str();
    let start = id.len().saturating_sub(RESOURCE_SUFFIX_LEN);
    id.get(start..).unwrap_or(id).to_owned()
}
