//! Integration tests for CRD operations
//!
//! These tests tell the story of how users and the VM platform interact with
//! Migration and VirtualMachine resources through the Kubernetes API.

use kube::api::{Api, Patch, PatchParams, PostParams};

use virt_migration_controller::crd::{Migration, MigrationPhase, VirtualMachine, VmPhase};

use super::helpers::{
    cleanup, create_vm, ensure_test_cluster, sample_migration, TEST_NAMESPACE,
};

/// Story: a user asks for a migration with extra placement constraints
///
/// Expected behavior:
/// - the Migration is stored with its selector and node selector
/// - it starts without a status, which reads as phase Unknown
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_user_creates_migration() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Migration> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-create-migration";

    let mut migration = sample_migration(name, "crd-vm");
    migration
        .spec
        .node_selector
        .insert("zone".to_string(), "eu".to_string());
    let created = api
        .create(&PostParams::default(), &migration)
        .await
        .expect("failed to create migration");

    assert_eq!(created.vm_name(), "crd-vm");
    assert_eq!(
        created.spec.node_selector.get("zone").map(String::as_str),
        Some("eu")
    );
    assert_eq!(created.phase(), MigrationPhase::Unknown);

    cleanup(&client, name, "crd-vm").await;
}

/// Story: the controller records progress on the status subresource only
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_migration_status_is_patched_independently() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let api: Api<Migration> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let name = "crd-status-migration";

    api.create(&PostParams::default(), &sample_migration(name, "crd-vm-2"))
        .await
        .expect("failed to create migration");

    let patch = serde_json::json!({ "status": { "phase": "Running" } });
    let updated = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .expect("failed to patch status");

    assert_eq!(updated.phase(), MigrationPhase::Running);
    assert_eq!(updated.vm_name(), "crd-vm-2");

    cleanup(&client, name, "crd-vm-2").await;
}

/// Story: the VM platform reports a VM running on a node
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_vm_status_round_trips() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let name = "crd-vm-status";

    let vm = create_vm(&client, name, VmPhase::Running, "node-a").await;
    assert_eq!(vm.phase(), VmPhase::Running);
    assert_eq!(vm.node_name(), "node-a");
    assert_eq!(vm.migration_node_name(), "");

    let api: Api<VirtualMachine> = Api::namespaced(client.clone(), TEST_NAMESPACE);
    let fetched = api.get(name).await.expect("failed to get VM");
    assert_eq!(fetched.node_name(), "node-a");

    cleanup(&client, "none", name).await;
}
