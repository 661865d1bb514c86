//! In-memory adapters.
//!
//! The mocks keep a small model of the backend (which resources exist, which
//! VMs are stopped) and accept every request by default. Status sequences can
//! be scripted per call, individual methods can be made to fail, and every
//! call is appended to an ordered log.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{
    AdapterFactory, ComputeStackAdapter, DeploymentStatus, InstanceStatus, OperationHandle,
    OperationStatus, OrchestratorServiceAdapter, ServiceStatus, VirtualMachineRequest,
};
use crate::error::{FormationError, FormationResult};
use crate::network::NetworkConfig;
use crate::types::BackendKey;

#[derive(Debug, Clone)]
enum Fault {
    Unavailable(String),
    Rejected(String),
    Declined,
}

/// Call log and failure injection shared by both mocks.
#[derive(Debug, Default)]
struct Script {
    calls: Vec<String>,
    faults: HashMap<&'static str, Fault>,
}

impl Script {
    /// Record a call and apply any fault registered for it.
    ///
    /// Returns `Ok(false)` when the method is configured to decline.
    fn enter(&mut self, method: &'static str) -> FormationResult<bool> {
        self.calls.push(method.to_owned());
        match self.faults.get(method) {
            None => Ok(true),
            Some(Fault::Declined) => Ok(false),
            Some(Fault::Unavailable(msg)) => Err(FormationError::unavailable(msg.clone())),
            Some(Fault::Rejected(msg)) => Err(FormationError::rejected(msg.clone())),
        }
    }

    /// Like [`Script::enter`] for methods that cannot decline.
    fn enter_strict(&mut self, method: &'static str) -> FormationResult<()> {
        if self.enter(method)? {
            Ok(())
        } else {
            Err(FormationError::rejected(format!("{method} declined")))
        }
    }
}

#[derive(Debug, Default)]
struct ComputeState {
    script: Script,
    cloud_services: HashSet<String>,
    storage_accounts: HashSet<String>,
    /// (service, slot) -> deployment name
    deployments: HashMap<(String, String), String>,
    /// (service, deployment, vm)
    virtual_machines: HashSet<(String, String, String)>,
    stopped: HashSet<String>,
    assigned_ports: Vec<u16>,
    operation_statuses: VecDeque<OperationStatus>,
    deployment_statuses: VecDeque<Option<DeploymentStatus>>,
    instance_statuses: VecDeque<Option<InstanceStatus>>,
    next_request: u64,
}

impl ComputeState {
    fn next_handle(&mut self, prefix: &str) -> OperationHandle {
        self.next_request += 1;
        OperationHandle::new(format!("{prefix}-{}", self.next_request))
    }

    fn slot_of(&self, service: &str, deployment: &str) -> Option<String> {
        self.deployments
            .iter()
            .find(|((s, _), name)| s == service && name.as_str() == deployment)
            .map(|((_, slot), _)| slot.clone())
    }
}

/// Scriptable compute-stack adapter.
#[derive(Debug, Default)]
pub struct MockComputeStack {
    state: Mutex<ComputeState>,
}

impl MockComputeStack {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ComputeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-create a cloud service.
    #[must_use]
    pub fn with_cloud_service(self, name: &str) -> Self {
        self.state().cloud_services.insert(name.to_owned());
        self
    }

    /// Pre-create a storage account.
    #[must_use]
    pub fn with_storage_account(self, name: &str) -> Self {
        self.state().storage_accounts.insert(name.to_owned());
        self
    }

    /// Pre-create a deployment in a slot.
    #[must_use]
    pub fn with_deployment(self, service: &str, slot: &str, deployment: &str) -> Self {
        self.state()
            .deployments
            .insert((service.to_owned(), slot.to_owned()), deployment.to_owned());
        self
    }

    /// Pre-create a VM inside a deployment.
    #[must_use]
    pub fn with_virtual_machine(self, service: &str, deployment: &str, vm_name: &str) -> Self {
        self.state().virtual_machines.insert((
            service.to_owned(),
            deployment.to_owned(),
            vm_name.to_owned(),
        ));
        self
    }

    /// Mark public ports as already taken.
    #[must_use]
    pub fn with_assigned_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.state().assigned_ports.extend(ports);
        self
    }

    /// Queue results for upcoming `get_operation_status` calls.
    pub fn script_operations(&self, statuses: impl IntoIterator<Item = OperationStatus>) {
        self.state().operation_statuses.extend(statuses);
    }

    /// Queue results for upcoming `get_deployment_status` calls.
    pub fn script_deployments(
        &self,
        statuses: impl IntoIterator<Item = Option<DeploymentStatus>>,
    ) {
        self.state().deployment_statuses.extend(statuses);
    }

    /// Queue results for upcoming `get_instance_status` calls.
    pub fn script_instances(&self, statuses: impl IntoIterator<Item = Option<InstanceStatus>>) {
        self.state().instance_statuses.extend(statuses);
    }

    /// Make a method fail with `BackendRejected`.
    pub fn reject(&self, method: &'static str, message: &str) {
        self.state()
            .script
            .faults
            .insert(method, Fault::Rejected(message.to_owned()));
    }

    /// Make a method fail with `BackendUnavailable`.
    pub fn make_unavailable(&self, method: &'static str, message: &str) {
        self.state()
            .script
            .faults
            .insert(method, Fault::Unavailable(message.to_owned()));
    }

    /// Make a creation method return `Ok(false)`.
    pub fn decline(&self, method: &'static str) {
        self.state().script.faults.insert(method, Fault::Declined);
    }

    /// Remove every injected failure.
    pub fn clear_faults(&self) {
        self.state().script.faults.clear();
    }

    /// Ordered log of the methods called so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().script.calls.clone()
    }

    /// How many times a method was called.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .script
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    /// Whether a cloud service currently exists.
    #[must_use]
    pub fn has_cloud_service(&self, name: &str) -> bool {
        self.state().cloud_services.contains(name)
    }

    /// Whether a storage account currently exists.
    #[must_use]
    pub fn has_storage_account(&self, name: &str) -> bool {
        self.state().storage_accounts.contains(name)
    }

    /// Whether a VM currently exists in any deployment.
    #[must_use]
    pub fn has_virtual_machine(&self, vm_name: &str) -> bool {
        self.state()
            .virtual_machines
            .iter()
            .any(|(_, _, vm)| vm == vm_name)
    }

    /// Whether a VM has been stopped.
    #[must_use]
    pub fn is_stopped(&self, vm_name: &str) -> bool {
        self.state().stopped.contains(vm_name)
    }
}

#[async_trait]
impl ComputeStackAdapter for MockComputeStack {
    async fn cloud_service_exists(&self, name: &str) -> FormationResult<bool> {
        let mut state = self.state();
        state.script.enter_strict("cloud_service_exists")?;
        Ok(state.cloud_services.contains(name))
    }

    async fn create_cloud_service(
        &self,
        name: &str,
        _label: &str,
        _location: &str,
    ) -> FormationResult<bool> {
        let mut state = self.state();
        if !state.script.enter("create_cloud_service")? {
            return Ok(false);
        }
        Ok(state.cloud_services.insert(name.to_owned()))
    }

    async fn delete_cloud_service(&self, name: &str) -> FormationResult<()> {
        let mut state = self.state();
        state.script.enter_strict("delete_cloud_service")?;
        state.cloud_services.remove(name);
        Ok(())
    }

    async fn storage_account_exists(&self, name: &str) -> FormationResult<bool> {
        let mut state = self.state();
        state.script.enter_strict("storage_account_exists")?;
        Ok(state.storage_accounts.contains(name))
    }

    async fn create_storage_account(
        &self,
        name: &str,
        _description: &str,
        _label: &str,
        _location: &str,
    ) -> FormationResult<bool> {
        let mut state = self.state();
        if !state.script.enter("create_storage_account")? {
            return Ok(false);
        }
        Ok(state.storage_accounts.insert(name.to_owned()))
    }

    async fn delete_storage_account(&self, name: &str) -> FormationResult<()> {
        let mut state = self.state();
        state.script.enter_strict("delete_storage_account")?;
        state.storage_accounts.remove(name);
        Ok(())
    }

    async fn deployment_exists(&self, service: &str, slot: &str) -> FormationResult<bool> {
        let mut state = self.state();
        state.script.enter_strict("deployment_exists")?;
        Ok(state
            .deployments
            .contains_key(&(service.to_owned(), slot.to_owned())))
    }

    async fn deployment_name(&self, service: &str, slot: &str) -> FormationResult<Option<String>> {
        let mut state = self.state();
        state.script.enter_strict("deployment_name")?;
        Ok(state
            .deployments
            .get(&(service.to_owned(), slot.to_owned()))
            .cloned())
    }

    async fn virtual_machine_exists(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
    ) -> FormationResult<bool> {
        let mut state = self.state();
        state.script.enter_strict("virtual_machine_exists")?;
        Ok(state.virtual_machines.contains(&(
            service.to_owned(),
            deployment.to_owned(),
            vm_name.to_owned(),
        )))
    }

    async fn create_virtual_machine_deployment(
        &self,
        request: &VirtualMachineRequest,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state
            .script
            .enter_strict("create_virtual_machine_deployment")?;
        state.deployments.insert(
            (
                request.service_name.clone(),
                request.deployment_slot.clone(),
            ),
            request.deployment_name.clone(),
        );
        state.virtual_machines.insert((
            request.service_name.clone(),
            request.deployment_name.clone(),
            request.vm_name.clone(),
        ));
        Ok(state.next_handle("create-deployment"))
    }

    async fn add_virtual_machine(
        &self,
        request: &VirtualMachineRequest,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state.script.enter_strict("add_virtual_machine")?;
        state.virtual_machines.insert((
            request.service_name.clone(),
            request.deployment_name.clone(),
            request.vm_name.clone(),
        ));
        Ok(state.next_handle("add-vm"))
    }

    async fn update_network_config(
        &self,
        service: &str,
        _deployment: &str,
        _vm_name: &str,
        network: &NetworkConfig,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state.script.enter_strict("update_network_config")?;
        if !state.cloud_services.contains(service) {
            return Err(FormationError::rejected(format!(
                "cloud service {service} does not exist"
            )));
        }
        let ports: Vec<u16> = network.endpoints.iter().map(|e| e.public_port).collect();
        state.assigned_ports.extend(ports);
        Ok(state.next_handle("update-network"))
    }

    async fn stop_virtual_machine(
        &self,
        _service: &str,
        _deployment: &str,
        vm_name: &str,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state.script.enter_strict("stop_virtual_machine")?;
        state.stopped.insert(vm_name.to_owned());
        Ok(state.next_handle("stop-vm"))
    }

    async fn delete_virtual_machine(
        &self,
        service: &str,
        deployment: &str,
        vm_name: &str,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state.script.enter_strict("delete_virtual_machine")?;
        state.virtual_machines.remove(&(
            service.to_owned(),
            deployment.to_owned(),
            vm_name.to_owned(),
        ));
        Ok(state.next_handle("delete-vm"))
    }

    async fn delete_deployment(
        &self,
        service: &str,
        deployment: &str,
    ) -> FormationResult<OperationHandle> {
        let mut state = self.state();
        state.script.enter_strict("delete_deployment")?;
        if let Some(slot) = state.slot_of(service, deployment) {
            state.deployments.remove(&(service.to_owned(), slot));
        }
        state
            .virtual_machines
            .retain(|(s, d, _)| !(s == service && d == deployment));
        Ok(state.next_handle("delete-deployment"))
    }

    async fn get_operation_status(
        &self,
        _handle: &OperationHandle,
    ) -> FormationResult<OperationStatus> {
        let mut state = self.state();
        state.script.enter_strict("get_operation_status")?;
        Ok(state
            .operation_statuses
            .pop_front()
            .unwrap_or(OperationStatus::Succeeded))
    }

    async fn get_deployment_status(
        &self,
        service: &str,
        slot: &str,
    ) -> FormationResult<Option<DeploymentStatus>> {
        let mut state = self.state();
        state.script.enter_strict("get_deployment_status")?;
        if let Some(scripted) = state.deployment_statuses.pop_front() {
            return Ok(scripted);
        }
        let exists = state
            .deployments
            .contains_key(&(service.to_owned(), slot.to_owned()));
        Ok(exists.then_some(DeploymentStatus::Running))
    }

    async fn get_instance_status(
        &self,
        _service: &str,
        _slot: &str,
        vm_name: &str,
    ) -> FormationResult<Option<InstanceStatus>> {
        let mut state = self.state();
        state.script.enter_strict("get_instance_status")?;
        if let Some(scripted) = state.instance_statuses.pop_front() {
            return Ok(scripted);
        }
        if state.stopped.contains(vm_name) {
            return Ok(Some(InstanceStatus::Stopped));
        }
        let exists = state
            .virtual_machines
            .iter()
            .any(|(_, _, vm)| vm == vm_name);
        Ok(exists.then_some(InstanceStatus::Ready))
    }

    async fn assigned_endpoints(&self, _service: &str) -> FormationResult<Vec<u16>> {
        let mut state = self.state();
        state.script.enter_strict("assigned_endpoints")?;
        Ok(state.assigned_ports.clone())
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    script: Script,
    /// (name, slot)
    deployments: HashSet<(String, String)>,
    running: HashSet<String>,
    statuses: VecDeque<Option<ServiceStatus>>,
}

/// Scriptable orchestrator-service adapter.
#[derive(Debug, Default)]
pub struct MockOrchestratorService {
    state: Mutex<ServiceState>,
}

impl MockOrchestratorService {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-create a deployment.
    #[must_use]
    pub fn with_deployment(self, name: &str, slot: &str) -> Self {
        self.state()
            .deployments
            .insert((name.to_owned(), slot.to_owned()));
        self
    }

    /// Queue results for upcoming `service_status` calls.
    pub fn script_statuses(&self, statuses: impl IntoIterator<Item = Option<ServiceStatus>>) {
        self.state().statuses.extend(statuses);
    }

    /// Make a method fail with `BackendRejected`.
    pub fn reject(&self, method: &'static str, message: &str) {
        self.state()
            .script
            .faults
            .insert(method, Fault::Rejected(message.to_owned()));
    }

    /// Make a method fail with `BackendUnavailable`.
    pub fn make_unavailable(&self, method: &'static str, message: &str) {
        self.state()
            .script
            .faults
            .insert(method, Fault::Unavailable(message.to_owned()));
    }

    /// Make a method return `Ok(false)`.
    pub fn decline(&self, method: &'static str) {
        self.state().script.faults.insert(method, Fault::Declined);
    }

    /// Ordered log of the methods called so far.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state().script.calls.clone()
    }

    /// How many times a method was called.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .script
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    /// Whether a deployment currently exists.
    #[must_use]
    pub fn has_deployment(&self, name: &str) -> bool {
        self.state().deployments.iter().any(|(n, _)| n == name)
    }

    /// Whether a service is running.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.state().running.contains(name)
    }
}

#[async_trait]
impl OrchestratorServiceAdapter for MockOrchestratorService {
    async fn deployment_exists(&self, name: &str, slot: &str) -> FormationResult<bool> {
        let mut state = self.state();
        state.script.enter_strict("deployment_exists")?;
        Ok(state
            .deployments
            .contains(&(name.to_owned(), slot.to_owned())))
    }

    async fn create_deployment_from_spec(
        &self,
        name: &str,
        slot: &str,
        _spec: &str,
    ) -> FormationResult<bool> {
        let mut state = self.state();
        if !state.script.enter("create_deployment_from_spec")? {
            return Ok(false);
        }
        state.deployments.insert((name.to_owned(), slot.to_owned()));
        Ok(true)
    }

    async fn start(&self, name: &str) -> FormationResult<bool> {
        let mut state = self.state();
        if !state.script.enter("start")? {
            return Ok(false);
        }
        state.running.insert(name.to_owned());
        Ok(true)
    }

    async fn stop(&self, name: &str) -> FormationResult<bool> {
        let mut state = self.state();
        if !state.script.enter("stop")? {
            return Ok(false);
        }
        state.running.remove(name);
        Ok(true)
    }

    async fn service_status(&self, name: &str) -> FormationResult<Option<ServiceStatus>> {
        let mut state = self.state();
        state.script.enter_strict("service_status")?;
        if let Some(scripted) = state.statuses.pop_front() {
            return Ok(scripted);
        }
        if state.running.contains(name) {
            return Ok(Some(ServiceStatus::Running));
        }
        let known = state.deployments.iter().any(|(n, _)| n == name);
        Ok(known.then_some(ServiceStatus::Stopped))
    }

    async fn delete_deployment(&self, name: &str, slot: &str) -> FormationResult<()> {
        let mut state = self.state();
        state.script.enter_strict("delete_deployment")?;
        state.deployments.remove(&(name.to_owned(), slot.to_owned()));
        state.running.remove(name);
        Ok(())
    }
}

/// Factory handing out the same pair of mocks for every key.
#[derive(Debug, Clone, Default)]
pub struct MockAdapterFactory {
    compute: Arc<MockComputeStack>,
    service: Arc<MockOrchestratorService>,
}

impl MockAdapterFactory {
    /// Create a factory around existing mocks.
    #[must_use]
    pub fn new(compute: Arc<MockComputeStack>, service: Arc<MockOrchestratorService>) -> Self {
        Self { compute, service }
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn compute_stack(&self, key: &BackendKey) -> FormationResult<Arc<dyn ComputeStackAdapter>> {
        if key.management_host.is_empty() {
            return Err(FormationError::invalid(format!(
                "backend key {} has no management host",
                key.id
            )));
        }
        Ok(self.compute.clone())
    }

    fn orchestrator_service(
        &self,
        key: &BackendKey,
    ) -> FormationResult<Arc<dyn OrchestratorServiceAdapter>> {
        if key.management_host.is_empty() {
            return Err(FormationError::invalid(format!(
                "backend key {} has no management host",
                key.id
            )));
        }
        Ok(self.service.clone())
    }
}
