//! Test fixtures for formation integration tests.

use cirrus_formation::types::{
    BackendKey, ComputeUnit, InputEndpoint, RawNetworkConfig, ServiceUnit, UnitDescriptor,
};

/// Backend key accepted by the mock adapter factory.
pub fn backend_key() -> BackendKey {
    BackendKey {
        id: "key-1".to_owned(),
        subscription_id: "sub-1".to_owned(),
        certificate_path: "/etc/cirrus/mgmt.pem".to_owned(),
        management_host: "management.test".to_owned(),
    }
}

/// Builder for compute-stack units.
pub struct ComputeUnitBuilder {
    unit: ComputeUnit,
}

impl ComputeUnitBuilder {
    /// Creates a unit with the given cloud service, storage account and VM.
    pub fn new(cloud_service: &str, storage: &str, vm: &str) -> Self {
        Self {
            unit: ComputeUnit {
                cloud_service_name: cloud_service.to_owned(),
                cloud_service_label: format!("{cloud_service} label"),
                cloud_service_location: "west-europe".to_owned(),
                storage_account_name: storage.to_owned(),
                storage_account_description: "experiment disks".to_owned(),
                storage_account_label: format!("{storage} label"),
                storage_account_location: "west-europe".to_owned(),
                virtual_machine_name: vm.to_owned(),
                virtual_machine_label: format!("{vm} label"),
                virtual_machine_size: "small".to_owned(),
                deployment_name: format!("{cloud_service}-deployment"),
                deployment_slot: "production".to_owned(),
                vm_image_name: "ubuntu-22.04".to_owned(),
                is_vm_image: false,
                system_config: serde_json::Value::Null,
                os_virtual_hard_disk: serde_json::Value::Null,
                network_config: RawNetworkConfig::default(),
                backend_key: backend_key(),
            },
        }
    }

    /// Boot from a captured VM image, which needs network configuration
    /// after the instance is up.
    pub fn vm_image(mut self) -> Self {
        self.unit.is_vm_image = true;
        self
    }

    /// Adds an input endpoint with an automatically assigned public port.
    pub fn with_endpoint(mut self, name: &str, local_port: u16) -> Self {
        self.unit.network_config.input_endpoints.push(InputEndpoint {
            name: name.to_owned(),
            protocol: "tcp".to_owned(),
            local_port,
            public_port: None,
        });
        self
    }

    /// Uses a backend key without a management host.
    pub fn with_unreachable_backend(mut self) -> Self {
        self.unit.backend_key.management_host = String::new();
        self
    }

    /// Builds the unit descriptor.
    pub fn build(self) -> UnitDescriptor {
        UnitDescriptor::ComputeStack(self.unit)
    }
}

/// Orchestrator-service unit with the given base name.
pub fn service_unit(name: &str) -> UnitDescriptor {
    UnitDescriptor::OrchestratorService(ServiceUnit {
        service_name: name.to_owned(),
        deployment_slot: "hackathon".to_owned(),
        image_name: "jupyter/base-notebook".to_owned(),
        deployment_spec: "kind: Deployment\nspec:\n  replicas: 1\n".to_owned(),
        backend_key: backend_key(),
    })
}

/// The compute unit used by most scenarios.
pub fn standard_compute_unit() -> UnitDescriptor {
    ComputeUnitBuilder::new("cs1", "sa1", "vm1").build()
}
