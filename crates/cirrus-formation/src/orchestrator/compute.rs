//! Compute-stack pipeline: cloud service, storage account, virtual machine.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::Pipeline;
use crate::adapter::{
    ComputeStackAdapter, DeploymentStatus, InstanceStatus, OperationStatus, VirtualMachineRequest,
};
use crate::context::{Direction, JobContext, UndoAction};
use crate::error::{FormationError, FormationResult};
use crate::network::{build_network_config, NetworkConfig};
use crate::step::{Step, Transition};
use crate::store::{FormationStore, ResourceFilter};
use crate::types::{ComputeUnit, Provider, ResourceKind, ResourceRecord, UnitDescriptor};

const CLOUD_SERVICE_CREATED: &str = "created";
const STORAGE_ACCOUNT_ONLINE: &str = "online";

/// Provisions a VM together with the cloud service and storage account it
/// depends on.
///
/// Every creation is guarded by an existence check against the live backend,
/// so re-running a step after a crash does not create duplicates.
pub struct ComputeStackPipeline {
    adapter: Arc<dyn ComputeStackAdapter>,
    store: Arc<dyn FormationStore>,
}

impl ComputeStackPipeline {
    /// Create a pipeline over an adapter and the resource mirror.
    pub fn new(adapter: Arc<dyn ComputeStackAdapter>, store: Arc<dyn FormationStore>) -> Self {
        Self { adapter, store }
    }

    async fn setup_cloud_service(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let name = &unit.cloud_service_name;
        let mut created = false;

        if self.adapter.cloud_service_exists(name).await? {
            debug!(name = %name, "cloud service exists");
        } else {
            if !self
                .adapter
                .create_cloud_service(name, &unit.cloud_service_label, &unit.cloud_service_location)
                .await?
            {
                return Ok(Transition::fail(format!(
                    "cloud service {name} was not created"
                )));
            }
            ctx.undo.push(UndoAction::DeleteCloudService { name: name.clone() });
            created = true;
            info!(name = %name, "cloud service created");
        }

        let record = ResourceRecord {
            kind: ResourceKind::CloudService,
            name: name.clone(),
            label: unit.cloud_service_label.clone(),
            description: String::new(),
            location: unit.cloud_service_location.clone(),
            status: CLOUD_SERVICE_CREATED.to_owned(),
            backend_key_id: unit.backend_key.id.clone(),
            created_at: Utc::now(),
        };
        self.mirror(record, created).await?;

        Ok(Transition::Next(Step::SetupStorage))
    }

    async fn setup_storage(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let name = &unit.storage_account_name;
        let mut created = false;

        if self.adapter.storage_account_exists(name).await? {
            debug!(name = %name, "storage account exists");
        } else {
            if !self
                .adapter
                .create_storage_account(
                    name,
                    &unit.storage_account_description,
                    &unit.storage_account_label,
                    &unit.storage_account_location,
                )
                .await?
            {
                return Ok(Transition::fail(format!(
                    "storage account {name} was not created"
                )));
            }
            ctx.undo
                .push(UndoAction::DeleteStorageAccount { name: name.clone() });
            created = true;
            info!(name = %name, "storage account created");
        }

        let record = ResourceRecord {
            kind: ResourceKind::StorageAccount,
            name: name.clone(),
            label: unit.storage_account_label.clone(),
            description: unit.storage_account_description.clone(),
            location: unit.storage_account_location.clone(),
            status: STORAGE_ACCOUNT_ONLINE.to_owned(),
            backend_key_id: unit.backend_key.id.clone(),
            created_at: Utc::now(),
        };
        self.mirror(record, created).await?;

        Ok(Transition::Next(Step::SetupVirtualMachine))
    }

    /// Keep exactly one mirror row per resource name.
    ///
    /// A fresh creation means any row already present describes an older
    /// resource that was deleted out of band, so it is purged first.
    async fn mirror(&self, record: ResourceRecord, created: bool) -> FormationResult<()> {
        let filter = ResourceFilter::new(record.kind).with_name(record.name.clone());

        if created {
            let stale = self.store.delete_resources(&filter).await?;
            if stale > 0 {
                debug!(name = %record.name, kind = %record.kind, stale, "purged stale mirror rows");
            }
        }

        if self.store.count_resources(&filter).await? == 0 {
            self.store.insert_resource(&record).await?;
        }
        Ok(())
    }

    async fn setup_virtual_machine(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let service = &unit.cloud_service_name;
        let slot = &unit.deployment_slot;
        let vm_name = ctx.resource_name.clone();

        if self.adapter.deployment_exists(service, slot).await? {
            let deployment = self
                .adapter
                .deployment_name(service, slot)
                .await?
                .ok_or_else(|| {
                    FormationError::rejected(format!(
                        "deployment in slot {slot} of {service} has no name"
                    ))
                })?;
            ctx.deployment_name = Some(deployment.clone());

            if self
                .adapter
                .virtual_machine_exists(service, &deployment, &vm_name)
                .await?
            {
                info!(vm = %vm_name, deployment = %deployment, "virtual machine exists, reconfiguring");
                return Ok(Transition::Next(Step::ConfigureNetwork));
            }

            let network = self.creation_network(unit).await?;
            let request = vm_request(unit, deployment.clone(), vm_name.clone(), network);
            let handle = self.adapter.add_virtual_machine(&request).await?;
            ctx.undo.push(UndoAction::DeleteVirtualMachine {
                service: service.clone(),
                deployment,
                vm_name,
            });
            ctx.operation = Some(handle);
            ctx.needs_config = unit.is_vm_image;
            return Ok(Transition::Poll(Step::WaitAddVirtualMachine));
        }

        let deployment = unit.deployment_name.clone();
        ctx.deployment_name = Some(deployment.clone());

        let network = self.creation_network(unit).await?;
        let request = vm_request(unit, deployment.clone(), vm_name, network);
        let handle = self
            .adapter
            .create_virtual_machine_deployment(&request)
            .await?;
        ctx.undo.push(UndoAction::DeleteDeployment {
            service: service.clone(),
            deployment,
        });
        ctx.operation = Some(handle);
        ctx.needs_config = unit.is_vm_image;
        Ok(Transition::Poll(Step::WaitCreateDeployment))
    }

    /// Endpoints for a VM about to be created.
    async fn creation_network(&self, unit: &ComputeUnit) -> FormationResult<NetworkConfig> {
        let assigned = self
            .adapter
            .assigned_endpoints(&unit.cloud_service_name)
            .await?;
        build_network_config(&unit.network_config, &assigned, unit.is_vm_image, false)
    }

    /// Poll the operation in flight; `on_success` is returned once it succeeds.
    async fn wait_operation(
        &self,
        ctx: &mut JobContext,
        current: Step,
        on_success: Transition,
    ) -> FormationResult<Transition> {
        let handle = ctx
            .operation
            .clone()
            .ok_or_else(|| FormationError::internal(format!("{current} has no operation")))?;

        match self.adapter.get_operation_status(&handle).await? {
            OperationStatus::Succeeded => {
                ctx.operation = None;
                Ok(on_success)
            }
            OperationStatus::Pending => Ok(Transition::Poll(current)),
            OperationStatus::Failed { error } => Ok(Transition::fail(format!(
                "operation {handle} failed: {error}"
            ))),
        }
    }

    async fn wait_deployment_ready(&self, unit: &ComputeUnit) -> FormationResult<Transition> {
        let status = self
            .adapter
            .get_deployment_status(&unit.cloud_service_name, &unit.deployment_slot)
            .await?;

        Ok(match status {
            None => Transition::fail(format!(
                "deployment in slot {} of {} is gone",
                unit.deployment_slot, unit.cloud_service_name
            )),
            Some(DeploymentStatus::Running) => Transition::Poll(Step::WaitInstanceReady),
            Some(_) => Transition::Poll(Step::WaitDeploymentReady),
        })
    }

    async fn wait_instance_ready(
        &self,
        unit: &ComputeUnit,
        ctx: &JobContext,
    ) -> FormationResult<Transition> {
        let status = self
            .adapter
            .get_instance_status(
                &unit.cloud_service_name,
                &unit.deployment_slot,
                &ctx.resource_name,
            )
            .await?;

        Ok(match status {
            None => Transition::fail(format!(
                "virtual machine {} is gone",
                ctx.resource_name
            )),
            Some(InstanceStatus::Ready) if ctx.needs_config => {
                Transition::Next(Step::ConfigureNetwork)
            }
            Some(InstanceStatus::Ready) => Transition::Done,
            Some(InstanceStatus::Failed(reason)) => Transition::fail(format!(
                "virtual machine {} failed: {reason}",
                ctx.resource_name
            )),
            Some(InstanceStatus::Starting | InstanceStatus::Stopped) => {
                Transition::Poll(Step::WaitInstanceReady)
            }
        })
    }

    /// An instance that disappeared while stopping counts as stopped.
    async fn wait_instance_stopped(
        &self,
        unit: &ComputeUnit,
        ctx: &JobContext,
    ) -> FormationResult<Transition> {
        let status = self
            .adapter
            .get_instance_status(
                &unit.cloud_service_name,
                &unit.deployment_slot,
                &ctx.resource_name,
            )
            .await?;

        Ok(match status {
            None | Some(InstanceStatus::Stopped) => Transition::Done,
            Some(InstanceStatus::Failed(reason)) => Transition::fail(format!(
                "virtual machine {} failed while stopping: {reason}",
                ctx.resource_name
            )),
            Some(InstanceStatus::Starting | InstanceStatus::Ready) => {
                Transition::Poll(Step::WaitInstanceStopped)
            }
        })
    }

    async fn configure_network(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let service = &unit.cloud_service_name;
        let deployment = self.resolve_deployment(unit, ctx).await?;

        let assigned = self.adapter.assigned_endpoints(service).await?;
        let network =
            build_network_config(&unit.network_config, &assigned, unit.is_vm_image, true)?;

        let handle = self
            .adapter
            .update_network_config(service, &deployment, &ctx.resource_name, &network)
            .await?;
        ctx.operation = Some(handle);
        Ok(Transition::Poll(Step::WaitConfigureNetwork))
    }

    async fn resolve_deployment(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<String> {
        if let Some(ref deployment) = ctx.deployment_name {
            return Ok(deployment.clone());
        }
        let deployment = self
            .adapter
            .deployment_name(&unit.cloud_service_name, &unit.deployment_slot)
            .await?
            .ok_or_else(|| {
                FormationError::rejected(format!(
                    "no deployment in slot {} of {}",
                    unit.deployment_slot, unit.cloud_service_name
                ))
            })?;
        ctx.deployment_name = Some(deployment.clone());
        Ok(deployment)
    }

    async fn stop_virtual_machine(
        &self,
        unit: &ComputeUnit,
        ctx: &mut JobContext,
    ) -> FormationResult<Transition> {
        let service = &unit.cloud_service_name;
        let Some(deployment) = self
            .adapter
            .deployment_name(service, &unit.deployment_slot)
            .await?
        else {
            info!(vm = %ctx.resource_name, "no deployment, nothing to stop");
            return Ok(Transition::Done);
        };

        if !self
            .adapter
            .virtual_machine_exists(service, &deployment, &ctx.resource_name)
            .await?
        {
            info!(vm = %ctx.resource_name, "virtual machine absent, nothing to stop");
            return Ok(Transition::Done);
        }

        let handle = self
            .adapter
            .stop_virtual_machine(service, &deployment, &ctx.resource_name)
            .await?;
        ctx.deployment_name = Some(deployment);
        ctx.operation = Some(handle);
        Ok(Transition::Poll(Step::WaitStopVirtualMachine))
    }
}

fn vm_request(
    unit: &ComputeUnit,
    deployment_name: String,
    vm_name: String,
    network_config: NetworkConfig,
) -> VirtualMachineRequest {
    VirtualMachineRequest {
        service_name: unit.cloud_service_name.clone(),
        deployment_name,
        deployment_slot: unit.deployment_slot.clone(),
        label: unit.virtual_machine_label.clone(),
        vm_name,
        system_config: unit.system_config.clone(),
        os_virtual_hard_disk: unit.os_virtual_hard_disk.clone(),
        network_config,
        role_size: unit.virtual_machine_size.clone(),
        vm_image_name: unit.vm_image_name.clone(),
    }
}

fn compute_unit(ctx: &JobContext) -> FormationResult<ComputeUnit> {
    match &ctx.unit {
        UnitDescriptor::ComputeStack(unit) => Ok(unit.clone()),
        UnitDescriptor::OrchestratorService(_) => Err(FormationError::internal(
            "orchestrator service unit routed to the compute stack pipeline",
        )),
    }
}

#[async_trait]
impl Pipeline for ComputeStackPipeline {
    fn name(&self) -> &'static str {
        Provider::ComputeStack.as_str()
    }

    fn entry_step(&self, direction: Direction) -> Step {
        Step::entry(Provider::ComputeStack, direction)
    }

    async fn run(&self, step: Step, ctx: &mut JobContext) -> FormationResult<Transition> {
        let unit = compute_unit(ctx)?;

        match step {
            Step::SetupCloudService => self.setup_cloud_service(&unit, ctx).await,
            Step::SetupStorage => self.setup_storage(&unit, ctx).await,
            Step::SetupVirtualMachine => self.setup_virtual_machine(&unit, ctx).await,
            Step::WaitAddVirtualMachine => {
                self.wait_operation(ctx, step, Transition::Poll(Step::WaitInstanceReady))
                    .await
            }
            Step::WaitCreateDeployment => {
                self.wait_operation(ctx, step, Transition::Poll(Step::WaitDeploymentReady))
                    .await
            }
            Step::WaitDeploymentReady => self.wait_deployment_ready(&unit).await,
            Step::WaitInstanceReady => self.wait_instance_ready(&unit, ctx).await,
            Step::ConfigureNetwork => self.configure_network(&unit, ctx).await,
            Step::WaitConfigureNetwork => {
                let ready = Transition::Poll(Step::WaitInstanceReady);
                let transition = self.wait_operation(ctx, step, ready.clone()).await?;
                if transition == ready {
                    ctx.needs_config = false;
                }
                Ok(transition)
            }
            Step::StopVirtualMachine => self.stop_virtual_machine(&unit, ctx).await,
            Step::WaitStopVirtualMachine => {
                self.wait_operation(ctx, step, Transition::Poll(Step::WaitInstanceStopped))
                    .await
            }
            Step::WaitInstanceStopped => self.wait_instance_stopped(&unit, ctx).await,
            other => Err(FormationError::internal(format!(
                "{other} is not a compute stack step"
            ))),
        }
    }

    async fn undo(&self, action: &UndoAction) -> FormationResult<()> {
        match action {
            UndoAction::DeleteCloudService { name } => {
                self.adapter.delete_cloud_service(name).await?;
                self.store
                    .delete_resources(
                        &ResourceFilter::new(ResourceKind::CloudService).with_name(name.clone()),
                    )
                    .await?;
            }
            UndoAction::DeleteStorageAccount { name } => {
                self.adapter.delete_storage_account(name).await?;
                self.store
                    .delete_resources(
                        &ResourceFilter::new(ResourceKind::StorageAccount).with_name(name.clone()),
                    )
                    .await?;
            }
            UndoAction::DeleteDeployment {
                service,
                deployment,
            } => {
                let handle = self.adapter.delete_deployment(service, deployment).await?;
                debug!(operation = %handle, deployment = %deployment, "deployment deletion accepted");
            }
            UndoAction::DeleteVirtualMachine {
                service,
                deployment,
                vm_name,
            } => {
                let handle = self
                    .adapter
                    .delete_virtual_machine(service, deployment, vm_name)
                    .await?;
                debug!(operation = %handle, vm = %vm_name, "virtual machine deletion accepted");
            }
            UndoAction::DeleteServiceDeployment { .. } => {
                return Err(FormationError::internal(
                    "service deployment undo routed to the compute stack pipeline",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::adapter::{MockComputeStack, OperationHandle};
    use crate::store::MemoryStore;
    use crate::types::{BackendKey, InputEndpoint, RawNetworkConfig};

    fn unit(is_vm_image: bool) -> ComputeUnit {
        ComputeUnit {
            cloud_service_name: "cs".to_owned(),
            cloud_service_label: "cs label".to_owned(),
            cloud_service_location: "west".to_owned(),
            storage_account_name: "sa".to_owned(),
            storage_account_description: "disks".to_owned(),
            storage_account_label: "sa label".to_owned(),
            storage_account_location: "west".to_owned(),
            virtual_machine_name: "vm".to_owned(),
            virtual_machine_label: "vm label".to_owned(),
            virtual_machine_size: "Small".to_owned(),
            deployment_name: "dep".to_owned(),
            deployment_slot: "production".to_owned(),
            vm_image_name: "ubuntu".to_owned(),
            is_vm_image,
            system_config: serde_json::Value::Null,
            os_virtual_hard_disk: serde_json::Value::Null,
            network_config: RawNetworkConfig {
                subnets: Vec::new(),
                input_endpoints: vec![InputEndpoint {
                    name: "ssh".to_owned(),
                    protocol: "tcp".to_owned(),
                    local_port: 22,
                    public_port: None,
                }],
            },
            backend_key: BackendKey {
                id: "key".to_owned(),
                subscription_id: "sub".to_owned(),
                certificate_path: "/certs/key.pem".to_owned(),
                management_host: "management.local".to_owned(),
            },
        }
    }

    fn context(unit: ComputeUnit) -> JobContext {
        JobContext::new(UnitDescriptor::ComputeStack(unit), "abc")
    }

    fn pipeline(mock: Arc<MockComputeStack>) -> (ComputeStackPipeline, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (ComputeStackPipeline::new(mock, store.clone()), store)
    }

    #[tokio::test]
    async fn existing_cloud_service_is_not_recreated_but_mirrored() {
        let mock = Arc::new(MockComputeStack::new().with_cloud_service("cs"));
        let (pipeline, store) = pipeline(mock.clone());
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::SetupCloudService, &mut ctx)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Next(Step::SetupStorage));
        assert_eq!(mock.call_count("create_cloud_service"), 0);
        assert!(ctx.undo.is_empty());
        let filter = ResourceFilter::new(ResourceKind::CloudService).with_name("cs");
        assert_eq!(store.count_resources(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fresh_creation_replaces_stale_mirror_rows() {
        let mock = Arc::new(MockComputeStack::new());
        let (pipeline, store) = pipeline(mock);
        let stale = ResourceRecord {
            kind: ResourceKind::StorageAccount,
            name: "sa".to_owned(),
            label: "old".to_owned(),
            description: String::new(),
            location: "east".to_owned(),
            status: "online".to_owned(),
            backend_key_id: "old-key".to_owned(),
            created_at: Utc::now(),
        };
        store.insert_resource(&stale).await.unwrap();
        store.insert_resource(&stale).await.unwrap();

        let mut ctx = context(unit(false));
        pipeline.run(Step::SetupStorage, &mut ctx).await.unwrap();

        let filter = ResourceFilter::new(ResourceKind::StorageAccount).with_name("sa");
        let rows = store.list_resources(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "sa label");
        assert_eq!(
            ctx.undo,
            vec![UndoAction::DeleteStorageAccount {
                name: "sa".to_owned()
            }]
        );
    }

    #[tokio::test]
    async fn declined_creation_fails_without_undo() {
        let mock = Arc::new(MockComputeStack::new());
        mock.decline("create_cloud_service");
        let (pipeline, _) = pipeline(mock);
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::SetupCloudService, &mut ctx)
            .await
            .unwrap();

        assert!(matches!(transition, Transition::Fail(_)));
        assert!(ctx.undo.is_empty());
    }

    #[tokio::test]
    async fn vm_image_creation_requires_network_config() {
        let mock = Arc::new(MockComputeStack::new());
        let (pipeline, _) = pipeline(mock);
        let mut ctx = context(unit(true));

        let transition = pipeline
            .run(Step::SetupVirtualMachine, &mut ctx)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Poll(Step::WaitCreateDeployment));
        assert!(ctx.needs_config);
        assert!(ctx.operation.is_some());
        assert_eq!(ctx.deployment_name.as_deref(), Some("dep"));
    }

    #[tokio::test]
    async fn existing_deployment_gets_vm_added() {
        let mock = Arc::new(
            MockComputeStack::new()
                .with_cloud_service("cs")
                .with_deployment("cs", "production", "live-dep"),
        );
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::SetupVirtualMachine, &mut ctx)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Poll(Step::WaitAddVirtualMachine));
        assert!(!ctx.needs_config);
        assert_eq!(ctx.deployment_name.as_deref(), Some("live-dep"));
        assert_eq!(mock.call_count("add_virtual_machine"), 1);
        assert_eq!(mock.call_count("create_virtual_machine_deployment"), 0);
    }

    #[tokio::test]
    async fn existing_vm_goes_straight_to_network_config() {
        let mock = Arc::new(
            MockComputeStack::new()
                .with_cloud_service("cs")
                .with_deployment("cs", "production", "dep")
                .with_virtual_machine("cs", "dep", "vm-abc"),
        );
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::SetupVirtualMachine, &mut ctx)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Next(Step::ConfigureNetwork));
        assert_eq!(mock.call_count("add_virtual_machine"), 0);
    }

    #[tokio::test]
    async fn configured_network_clears_the_flag() {
        let mock = Arc::new(MockComputeStack::new().with_cloud_service("cs"));
        let (pipeline, _) = pipeline(mock);
        let mut ctx = context(unit(true));
        ctx.needs_config = true;
        ctx.deployment_name = Some("dep".to_owned());

        let transition = pipeline
            .run(Step::ConfigureNetwork, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Poll(Step::WaitConfigureNetwork));

        let transition = pipeline
            .run(Step::WaitConfigureNetwork, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Poll(Step::WaitInstanceReady));
        assert!(!ctx.needs_config);
        assert!(ctx.operation.is_none());
    }

    #[tokio::test]
    async fn missing_instance_status_fails() {
        let mock = Arc::new(MockComputeStack::new());
        mock.script_instances([None]);
        let (pipeline, _) = pipeline(mock);
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::WaitInstanceReady, &mut ctx)
            .await
            .unwrap();
        assert!(matches!(transition, Transition::Fail(_)));
    }

    #[tokio::test]
    async fn failed_network_update_keeps_configuration_pending() {
        let mock = Arc::new(MockComputeStack::new());
        mock.script_operations([OperationStatus::Failed {
            error: "port conflict".to_owned(),
        }]);
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(true));
        ctx.needs_config = true;
        ctx.operation = Some(OperationHandle::new("update-network-1"));

        let transition = pipeline
            .run(Step::WaitConfigureNetwork, &mut ctx)
            .await
            .unwrap();

        assert!(matches!(transition, Transition::Fail(ref r) if r.contains("port conflict")));
        assert!(ctx.needs_config);
        assert_eq!(mock.call_count("get_instance_status"), 0);
    }

    #[tokio::test]
    async fn existing_vm_skips_endpoint_resolution() {
        let mock = Arc::new(
            MockComputeStack::new()
                .with_cloud_service("cs")
                .with_deployment("cs", "production", "dep")
                .with_virtual_machine("cs", "dep", "vm-abc"),
        );
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(false));
        assert_eq!(ctx.resource_name, "vm-abc");

        let transition = pipeline
            .run(Step::SetupVirtualMachine, &mut ctx)
            .await
            .unwrap();

        assert_eq!(transition, Transition::Next(Step::ConfigureNetwork));
        assert_eq!(mock.call_count("assigned_endpoints"), 0);
    }

    #[tokio::test]
    async fn stop_waits_for_the_instance_to_report_stopped() {
        let mock = Arc::new(MockComputeStack::new());
        mock.script_operations([OperationStatus::Succeeded]);
        mock.script_instances([Some(InstanceStatus::Ready), Some(InstanceStatus::Stopped)]);
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(false));
        ctx.operation = Some(OperationHandle::new("stop-vm-1"));

        let transition = pipeline
            .run(Step::WaitStopVirtualMachine, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Poll(Step::WaitInstanceStopped));

        let transition = pipeline
            .run(Step::WaitInstanceStopped, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Poll(Step::WaitInstanceStopped));

        let transition = pipeline
            .run(Step::WaitInstanceStopped, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Done);
        assert_eq!(mock.call_count("get_instance_status"), 2);
    }

    #[tokio::test]
    async fn vanished_instance_counts_as_stopped() {
        let mock = Arc::new(MockComputeStack::new());
        mock.script_instances([None]);
        let (pipeline, _) = pipeline(mock);
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::WaitInstanceStopped, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Done);
    }

    #[tokio::test]
    async fn stop_without_deployment_is_done() {
        let mock = Arc::new(MockComputeStack::new());
        let (pipeline, _) = pipeline(mock.clone());
        let mut ctx = context(unit(false));

        let transition = pipeline
            .run(Step::StopVirtualMachine, &mut ctx)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Done);
        assert_eq!(mock.call_count("stop_virtual_machine"), 0);
    }

    #[tokio::test]
    async fn undo_removes_resource_and_mirror() {
        let mock = Arc::new(MockComputeStack::new());
        let (pipeline, store) = pipeline(mock.clone());
        let mut ctx = context(unit(false));
        pipeline
            .run(Step::SetupCloudService, &mut ctx)
            .await
            .unwrap();
        assert!(mock.has_cloud_service("cs"));

        for action in ctx.undo.iter().rev() {
            pipeline.undo(action).await.unwrap();
        }

        assert!(!mock.has_cloud_service("cs"));
        let filter = ResourceFilter::new(ResourceKind::CloudService);
        assert_eq!(store.count_resources(&filter).await.unwrap(), 0);
    }
}
