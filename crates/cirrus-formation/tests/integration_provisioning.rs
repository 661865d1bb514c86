//! Integration tests for provisioning experiments end to end.

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Utc;
use cirrus_formation::adapter::{
    DeploymentStatus, InstanceStatus, MockComputeStack, MockOrchestratorService, OperationStatus,
};
use cirrus_formation::store::{FormationStore, ResourceFilter};
use cirrus_formation::types::{
    EnvironmentStatus, ExperimentStatus, HackathonId, ResourceKind, ResourceRecord,
};
use cirrus_formation::{OrchestratorSettings, Step};
use common::fixtures::{service_unit, standard_compute_unit, ComputeUnitBuilder};
use common::{TestHarness, HACKATHON, POLL_INTERVAL};

#[tokio::test]
async fn compute_unit_runs_setup_and_polls_in_order() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0001").await;
    harness.compute.script_operations([
        OperationStatus::Pending,
        OperationStatus::Pending,
        OperationStatus::Succeeded,
    ]);

    harness
        .lifecycle
        .start(&record.id, &HackathonId::new(HACKATHON), vec![standard_compute_unit()])
        .await
        .unwrap();
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Starting
    );

    harness.run_to_completion().await;

    assert_eq!(
        harness.compute_actions(),
        vec![
            "create_cloud_service",
            "create_storage_account",
            "create_virtual_machine_deployment",
            "get_operation_status",
            "get_operation_status",
            "get_operation_status",
            "get_deployment_status",
            "get_instance_status",
        ]
    );

    // The last unit finishes the experiment without re-arming it.
    let history = harness.scheduler.history();
    let last = history.last().unwrap();
    assert_eq!(last.step(), Step::WaitInstanceReady);
    assert_eq!(
        history
            .iter()
            .filter(|s| s.step() == Step::BeginUnit)
            .count(),
        1
    );

    let stored = harness.experiment(&record.id).await;
    assert_eq!(stored.status, ExperimentStatus::Running);
    assert_eq!(stored.environments.len(), 1);
    assert_eq!(stored.environments[0].name, "vm1-exp-0001");
    assert_eq!(stored.environments[0].status, EnvironmentStatus::Running);
}

#[tokio::test]
async fn pending_operation_rearms_once_per_poll_at_the_interval() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0002").await;
    let pending = 4;
    harness.compute.script_operations(
        std::iter::repeat(OperationStatus::Pending)
            .take(pending)
            .chain([OperationStatus::Succeeded]),
    );

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    let waits: Vec<_> = harness
        .scheduler
        .history()
        .into_iter()
        .filter(|s| s.step() == Step::WaitCreateDeployment)
        .collect();

    // First entry plus one re-arm per pending answer.
    assert_eq!(waits.len(), pending + 1);
    assert!(waits.iter().all(|s| s.delay == POLL_INTERVAL));
    assert_eq!(
        harness.compute.call_count("get_operation_status"),
        pending + 1
    );
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}

#[tokio::test]
async fn non_wait_steps_run_without_delay() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0003").await;

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    for submission in harness.scheduler.history() {
        let expected = if submission.step().is_wait() {
            POLL_INTERVAL
        } else {
            std::time::Duration::ZERO
        };
        assert_eq!(submission.delay, expected, "{}", submission.step());
    }
}

#[tokio::test]
async fn units_run_strictly_in_template_order() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0004").await;

    harness
        .lifecycle
        .start(
            &record.id,
            &record.hackathon_id,
            vec![
                standard_compute_unit(),
                service_unit("jupyter"),
                ComputeUnitBuilder::new("cs2", "sa2", "vm2").build(),
            ],
        )
        .await
        .unwrap();
    harness.run_to_completion().await;

    // The cursor never moves backwards and each unit's steps are contiguous.
    let indices: Vec<usize> = harness
        .scheduler
        .history()
        .iter()
        .map(|s| s.unit_index())
        .collect();
    assert!(indices.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(indices.last(), Some(&3));

    let stored = harness.experiment(&record.id).await;
    assert_eq!(stored.status, ExperimentStatus::Running);
    assert!(stored
        .environments
        .iter()
        .all(|e| e.status == EnvironmentStatus::Running));
    assert!(harness.service.is_running("jupyter-exp-0004"));
    assert!(harness.compute.has_virtual_machine("vm2-exp-0004"));
}

#[tokio::test]
async fn rerun_reuses_existing_resources() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0005").await;

    for _ in 0..2 {
        harness
            .lifecycle
            .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
            .await
            .unwrap();
        harness.run_to_completion().await;
    }

    assert_eq!(harness.compute.call_count("create_cloud_service"), 1);
    assert_eq!(harness.compute.call_count("create_storage_account"), 1);
    assert_eq!(
        harness
            .compute
            .call_count("create_virtual_machine_deployment"),
        1
    );
    // The second run finds the VM and only reapplies its network settings.
    assert_eq!(harness.compute.call_count("update_network_config"), 1);

    let services = harness
        .store
        .count_resources(&ResourceFilter::new(ResourceKind::CloudService).with_name("cs1"))
        .await
        .unwrap();
    let accounts = harness
        .store
        .count_resources(&ResourceFilter::new(ResourceKind::StorageAccount).with_name("sa1"))
        .await
        .unwrap();
    assert_eq!(services, 1);
    assert_eq!(accounts, 1);
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}

#[tokio::test]
async fn fresh_creation_replaces_stale_mirror_rows() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0006").await;
    let stale = ResourceRecord {
        kind: ResourceKind::CloudService,
        name: "cs1".to_owned(),
        label: "old".to_owned(),
        description: String::new(),
        location: "east".to_owned(),
        status: "created".to_owned(),
        backend_key_id: "key-0".to_owned(),
        created_at: Utc::now(),
    };
    harness.store.insert_resource(&stale).await.unwrap();
    harness.store.insert_resource(&stale).await.unwrap();

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    let rows = harness
        .store
        .list_resources(&ResourceFilter::new(ResourceKind::CloudService).with_name("cs1"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].backend_key_id, "key-1");
    assert_eq!(rows[0].location, "west-europe");
}

#[tokio::test]
async fn existing_resources_keep_their_mirror_rows() {
    let harness = TestHarness::with_backends(
        MockComputeStack::new()
            .with_cloud_service("cs1")
            .with_storage_account("sa1"),
        MockOrchestratorService::new(),
        OrchestratorSettings::default(),
    );
    let record = harness.create_experiment("exp-0007").await;

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    assert_eq!(harness.compute.call_count("create_cloud_service"), 0);
    assert_eq!(harness.compute.call_count("create_storage_account"), 0);

    // Pre-existing resources are mirrored once as well.
    let rows = harness
        .store
        .list_resources(&ResourceFilter::new(ResourceKind::StorageAccount))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "online");
}

#[tokio::test]
async fn vm_added_to_existing_deployment() {
    let harness = TestHarness::with_backends(
        MockComputeStack::new()
            .with_cloud_service("cs1")
            .with_deployment("cs1", "production", "shared-deployment"),
        MockOrchestratorService::new(),
        OrchestratorSettings::default(),
    );
    let record = harness.create_experiment("exp-0008").await;

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    assert_eq!(harness.compute.call_count("add_virtual_machine"), 1);
    assert_eq!(
        harness
            .compute
            .call_count("create_virtual_machine_deployment"),
        0
    );
    // Adding a VM skips the deployment-level wait.
    assert_eq!(harness.compute.call_count("get_deployment_status"), 0);
    assert!(harness.compute.has_virtual_machine("vm1-exp-0008"));
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}

#[tokio::test]
async fn vm_image_is_configured_once_the_instance_is_ready() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0009").await;
    let unit = ComputeUnitBuilder::new("cs1", "sa1", "vm1")
        .vm_image()
        .with_endpoint("ssh", 22)
        .with_endpoint("http", 8888)
        .build();
    harness.compute.script_instances([
        Some(InstanceStatus::Starting),
        Some(InstanceStatus::Ready),
    ]);

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![unit])
        .await
        .unwrap();
    harness.run_to_completion().await;

    let actions = harness.compute_actions();
    assert_eq!(
        actions,
        vec![
            "create_cloud_service",
            "create_storage_account",
            "create_virtual_machine_deployment",
            "get_operation_status",
            "get_deployment_status",
            "get_instance_status",
            "get_instance_status",
            "update_network_config",
            "get_operation_status",
            "get_instance_status",
        ]
    );

    let configure = harness
        .scheduler
        .history()
        .into_iter()
        .find(|s| s.step() == Step::ConfigureNetwork)
        .unwrap();
    assert_eq!(configure.delay, std::time::Duration::ZERO);
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}

#[tokio::test]
async fn deployment_not_yet_running_is_polled_again() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0010").await;
    harness.compute.script_deployments([
        Some(DeploymentStatus::Starting),
        Some(DeploymentStatus::Other("Deploying".to_owned())),
    ]);

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![standard_compute_unit()])
        .await
        .unwrap();
    harness.run_to_completion().await;

    assert_eq!(harness.compute.call_count("get_deployment_status"), 3);
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}

#[tokio::test]
async fn stop_brings_every_unit_down() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0011").await;
    let units = vec![standard_compute_unit(), service_unit("jupyter")];

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, units.clone())
        .await
        .unwrap();
    harness.run_to_completion().await;

    harness.lifecycle.stop(&record.id, units).await.unwrap();
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Stopping
    );
    harness.run_to_completion().await;

    assert!(harness.compute.is_stopped("vm1-exp-0011"));
    assert!(harness
        .scheduler
        .history()
        .iter()
        .any(|s| s.step() == Step::WaitInstanceStopped));
    assert!(!harness.service.is_running("jupyter-exp-0011"));

    let stored = harness.experiment(&record.id).await;
    assert_eq!(stored.status, ExperimentStatus::Stopped);
    assert!(stored
        .environments
        .iter()
        .all(|e| e.status == EnvironmentStatus::Stopped));
}

#[tokio::test]
async fn stop_without_resources_is_a_no_op() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0012").await;

    harness
        .lifecycle
        .stop(
            &record.id,
            vec![standard_compute_unit(), service_unit("jupyter")],
        )
        .await
        .unwrap();
    harness.run_to_completion().await;

    assert_eq!(harness.compute.call_count("stop_virtual_machine"), 0);
    assert_eq!(harness.service.call_count("stop"), 0);
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Stopped
    );
}

#[tokio::test]
async fn service_deployment_is_created_then_started() {
    let harness = TestHarness::new();
    let record = harness.create_experiment("exp-0013").await;

    harness
        .lifecycle
        .start(&record.id, &record.hackathon_id, vec![service_unit("jupyter")])
        .await
        .unwrap();
    harness.run_to_completion().await;

    assert_eq!(
        harness.service.calls(),
        vec![
            "deployment_exists",
            "create_deployment_from_spec",
            "start",
            "service_status",
        ]
    );
    assert!(harness.service.has_deployment("jupyter-exp-0013"));
    assert_eq!(
        harness.experiment(&record.id).await.status,
        ExperimentStatus::Running
    );
}
