//! Cluster-facing collaborators of the migration reconciler
//!
//! The reconciler never talks to the API server directly. Everything it
//! reads or writes goes through [`VmService`] and [`ClusterClient`], which
//! keeps the state machine testable with mocks while production uses the
//! kube-backed implementations below.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Affinity, Container, Node, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, Pod, PodSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::pod::{
    APP_LABEL, DOMAIN_LABEL, HOSTNAME_LABEL, MIGRATION_APP, MIGRATION_LABEL, MIGRATION_UID_LABEL,
    VIRT_LAUNCHER_APP,
};
use crate::crd::{Migration, VirtualMachine};
use crate::Error;

/// Field manager used for status patches
const FIELD_MANAGER: &str = "virt-migration-controller";

/// Trait abstracting VM platform operations needed by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmService: Send + Sync {
    /// Fetch a VM by name; `None` if it does not exist
    async fn fetch_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error>;

    /// List the unfinished pods hosting (or about to host) the VM
    async fn get_running_vm_pods(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, Error>;

    /// Create the target pod for a Migration
    ///
    /// Idempotent: at most one pod is ever created per Migration UID.
    async fn create_migration_target_pod(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
    ) -> Result<(), Error>;

    /// Launch the migration job that moves the VM from `source` to `target`
    async fn start_migration(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
        source: &Node,
        target: &Node,
        target_pod: &Pod,
    ) -> Result<(), Error>;

    /// Get the migration job pod of a Migration; `None` if not started yet
    async fn get_migration_job(&self, migration: &Migration) -> Result<Option<Pod>, Error>;

    /// Persist the Migration status
    async fn update_migration(&self, migration: &Migration) -> Result<(), Error>;

    /// Persist the VM (spec, labels and status)
    async fn put_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error>;
}

/// Trait abstracting cluster-scoped lookups
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Node by name
    async fn get_node(&self, name: &str) -> Result<Node, Error>;
}

/// Kubernetes-backed [`VmService`]
pub struct KubeVmService {
    client: Client,
    launcher_image: String,
    migrator_image: String,
}

impl KubeVmService {
    /// Create a service that spawns pods from the given images
    pub fn new(
        client: Client,
        launcher_image: impl Into<String>,
        migrator_image: impl Into<String>,
    ) -> Self {
        Self {
            client,
            launcher_image: launcher_image.into(),
            migrator_image: migrator_image.into(),
        }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn vms(&self, namespace: &str) -> Api<VirtualMachine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl VmService for KubeVmService {
    async fn fetch_vm(&self, namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        Ok(self.vms(namespace).get_opt(name).await?)
    }

    async fn get_running_vm_pods(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, Error> {
        let namespace = vm.namespace().unwrap_or_default();
        let params = ListParams::default()
            .labels(&vm_pod_selector(&vm.name_any()))
            .fields(UNFINISHED_POD_FIELDS);
        Ok(self.pods(&namespace).list(&params).await?.items)
    }

    async fn create_migration_target_pod(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
    ) -> Result<(), Error> {
        let namespace = migration.namespace().unwrap_or_default();
        let uid = migration_uid(migration)?;
        let pods = self.pods(&namespace);

        let params = ListParams::default().labels(&format!("{MIGRATION_UID_LABEL}={uid}"));
        if !pods.list(&params).await?.items.is_empty() {
            debug!(migration = %migration.name_any(), "target pod already exists");
            return Ok(());
        }

        let pod = build_target_pod(migration, vm, &self.launcher_image)?;
        let created = pods.create(&PostParams::default(), &pod).await?;
        info!(
            migration = %migration.name_any(),
            vm = %vm.name_any(),
            pod = %created.name_any(),
            "created migration target pod"
        );
        Ok(())
    }

    async fn start_migration(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
        source: &Node,
        target: &Node,
        target_pod: &Pod,
    ) -> Result<(), Error> {
        let namespace = migration.namespace().unwrap_or_default();
        let job = build_migration_job(migration, vm, source, target, &self.migrator_image)?;
        let created = self.pods(&namespace).create(&PostParams::default(), &job).await?;
        info!(
            migration = %migration.name_any(),
            vm = %vm.name_any(),
            job = %created.name_any(),
            target_pod = %target_pod.name_any(),
            "started migration job"
        );
        Ok(())
    }

    async fn get_migration_job(&self, migration: &Migration) -> Result<Option<Pod>, Error> {
        let namespace = migration.namespace().unwrap_or_default();
        let uid = migration_uid(migration)?;
        let params = ListParams::default().labels(&format!(
            "{APP_LABEL}={MIGRATION_APP},{MIGRATION_UID_LABEL}={uid}"
        ));
        let mut jobs = self.pods(&namespace).list(&params).await?.items;
        if jobs.len() > 1 {
            return Err(Error::invariant(format!(
                "found {} migration jobs for migration {}",
                jobs.len(),
                migration.name_any()
            )));
        }
        Ok(jobs.pop())
    }

    async fn update_migration(&self, migration: &Migration) -> Result<(), Error> {
        let namespace = migration.namespace().unwrap_or_default();
        let api: Api<Migration> = Api::namespaced(self.client.clone(), &namespace);
        let patch = migration_status_patch(migration);
        api.patch_status(
            &migration.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn put_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error> {
        let namespace = vm.namespace().unwrap_or_default();
        let name = vm.name_any();
        let api = self.vms(&namespace);

        // Spec and labels go through the main resource, guarded by resourceVersion
        api.replace(&name, &PostParams::default(), vm).await?;

        // Every status field is spelled out so an empty migrationNodeName clears it
        let status = vm.status.clone().unwrap_or_default();
        let patch = serde_json::json!({
            "status": {
                "phase": status.phase,
                "nodeName": status.node_name,
                "migrationNodeName": status.migration_node_name,
            }
        });
        let updated = api
            .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(updated)
    }
}

/// Kubernetes-backed [`ClusterClient`]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }
}

// =============================================================================
// Pod templates
// =============================================================================

/// Excludes finished pods so pods of deleted Migrations never block new ones
const UNFINISHED_POD_FIELDS: &str = "status.phase!=Succeeded,status.phase!=Failed";

/// Status patch that only applies over the revision the pass read.
///
/// A Migration changed since then is rejected with 409 Conflict and the
/// pass is retried against the fresh copy.
pub fn migration_status_patch(migration: &Migration) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": migration.resource_version() },
        "status": migration.status,
    })
}

/// Label selector matching every launcher pod of a VM
pub fn vm_pod_selector(vm_name: &str) -> String {
    format!("{APP_LABEL}={VIRT_LAUNCHER_APP},{DOMAIN_LABEL}={vm_name}")
}

fn migration_uid(migration: &Migration) -> Result<String, Error> {
    migration
        .uid()
        .ok_or_else(|| Error::internal("vm-service", "migration has no uid"))
}

fn migration_labels(
    migration: &Migration,
    vm: &VirtualMachine,
    app: &str,
) -> Result<BTreeMap<String, String>, Error> {
    Ok(BTreeMap::from([
        (APP_LABEL.to_string(), app.to_string()),
        (DOMAIN_LABEL.to_string(), vm.name_any()),
        (MIGRATION_LABEL.to_string(), migration.name_any()),
        (MIGRATION_UID_LABEL.to_string(), migration_uid(migration)?),
    ]))
}

/// Render the pod that will host the VM on its new node.
///
/// The VM's node selector (already merged with the Migration's) constrains
/// placement; a required anti-affinity keeps it off the source node.
pub fn build_target_pod(
    migration: &Migration,
    vm: &VirtualMachine,
    image: &str,
) -> Result<Pod, Error> {
    let vm_name = vm.name_any();
    let namespace = migration.namespace().unwrap_or_default();

    let affinity = (!vm.node_name().is_empty()).then(|| Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "NotIn".to_string(),
                        values: Some(vec![vm.node_name().to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("virt-launcher-{vm_name}-")),
            namespace: Some(namespace.clone()),
            labels: Some(migration_labels(migration, vm, VIRT_LAUNCHER_APP)?),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            node_selector: (!vm.spec.node_selector.is_empty())
                .then(|| vm.spec.node_selector.clone()),
            affinity,
            containers: vec![Container {
                name: "compute".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "/virt-launcher".to_string(),
                    "--name".to_string(),
                    vm_name,
                    "--namespace".to_string(),
                    namespace,
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    })
}

/// Render the short-lived pod that transfers the VM from `source` to `target`.
pub fn build_migration_job(
    migration: &Migration,
    vm: &VirtualMachine,
    source: &Node,
    target: &Node,
    image: &str,
) -> Result<Pod, Error> {
    let source_ip = node_internal_ip(source).ok_or_else(|| Error::NodeAddress {
        node: source.name_any(),
    })?;
    let target_ip = node_internal_ip(target).ok_or_else(|| Error::NodeAddress {
        node: target.name_any(),
    })?;

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some("virt-migration-".to_string()),
            namespace: migration.namespace(),
            labels: Some(migration_labels(migration, vm, MIGRATION_APP)?),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "virt-migration".to_string(),
                image: Some(image.to_string()),
                command: Some(vec![
                    "/migrate".to_string(),
                    vm.name_any(),
                    "--source".to_string(),
                    format!("qemu+tcp://{source_ip}/system"),
                    "--dest".to_string(),
                    format!("qemu+tcp://{target_ip}/system"),
                    "--node-ip".to_string(),
                    target_ip.to_string(),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    })
}

/// First InternalIP address reported by the node
pub fn node_internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "InternalIP")
        .map(|addr| addr.address.as_str())
}
