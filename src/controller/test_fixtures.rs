//! Builders and an in-memory VM platform shared by controller tests

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::Mutex;

use super::service::{ClusterClient, VmService};
use crate::crd::pod::{
    pod_label, APP_LABEL, DOMAIN_LABEL, MIGRATION_APP, MIGRATION_LABEL, MIGRATION_UID_LABEL,
    VIRT_LAUNCHER_APP,
};
use crate::crd::{
    Migration, MigrationPhase, MigrationSpec, PodPhase, VirtualMachine, VirtualMachineSpec,
    VmPhase, VmSelector,
};
use crate::Error;

pub const NAMESPACE: &str = "default";

// =============================================================================
// Object builders
// =============================================================================

pub fn migration(name: &str, uid: &str, vm: &str, phase: MigrationPhase) -> Migration {
    let mut migration = Migration::new(
        name,
        MigrationSpec {
            selector: VmSelector {
                name: vm.to_string(),
            },
            node_selector: BTreeMap::new(),
        },
    );
    migration.metadata.namespace = Some(NAMESPACE.to_string());
    migration.metadata.uid = Some(uid.to_string());
    if phase != MigrationPhase::Unknown {
        migration.set_phase(phase);
    }
    migration
}

pub fn migration_store(migrations: Vec<Migration>) -> (Store<Migration>, Writer<Migration>) {
    let (store, mut writer) = reflector::store();
    for migration in migrations {
        writer.apply_watcher_event(&watcher::Event::Apply(migration));
    }
    (store, writer)
}

pub fn vm(name: &str, phase: VmPhase, node: &str) -> VirtualMachine {
    let mut vm = VirtualMachine::new(name, VirtualMachineSpec::default());
    vm.metadata.namespace = Some(NAMESPACE.to_string());
    let status = vm.status_mut();
    status.phase = phase;
    status.node_name = node.to_string();
    vm
}

pub fn node(name: &str, internal_ip: Option<&str>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(NodeStatus {
            addresses: internal_ip.map(|ip| {
                vec![NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pod_with_labels(name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Set phase and node of a pod in place
pub fn place_pod(pod: &mut Pod, phase: PodPhase, node: &str) {
    pod.status = Some(PodStatus {
        phase: Some(phase.as_str().to_string()),
        ..Default::default()
    });
    let spec = pod.spec.get_or_insert_with(Default::default);
    spec.node_name = (!node.is_empty()).then(|| node.to_string());
}

/// Target pod of `migration` for `vm` in the given phase
pub fn target_pod(migration: &Migration, vm: &str, phase: PodPhase, node: &str) -> Pod {
    let uid = migration.uid().unwrap_or_default();
    let name = migration.name_any();
    let mut pod = pod_with_labels(
        &format!("virt-launcher-{vm}-{name}"),
        &[
            (APP_LABEL, VIRT_LAUNCHER_APP),
            (DOMAIN_LABEL, vm),
            (MIGRATION_LABEL, &name),
            (MIGRATION_UID_LABEL, &uid),
        ],
    );
    place_pod(&mut pod, phase, node);
    pod
}

/// The VM's original launcher pod
pub fn launcher_pod(vm: &str, node: &str) -> Pod {
    let mut pod = pod_with_labels(
        &format!("virt-launcher-{vm}"),
        &[(APP_LABEL, VIRT_LAUNCHER_APP), (DOMAIN_LABEL, vm)],
    );
    place_pod(&mut pod, PodPhase::Running, node);
    pod
}

// =============================================================================
// In-memory VM platform
// =============================================================================

/// Calls that change cluster state, in the order they happened
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    CreateTargetPod { migration: String },
    StartMigration { migration: String, source: String, target: String },
    UpdateMigration { migration: String, phase: MigrationPhase },
    PutVm { vm: String, phase: VmPhase, node: String, migration_node: String },
}

#[derive(Default)]
struct Platform {
    vms: HashMap<String, VirtualMachine>,
    pods: Vec<Pod>,
    mutations: Vec<Mutation>,
}

/// A [`VmService`] backed by maps, writing Migration updates through to a
/// reflector store the way the migration watcher would
pub struct FakeVmService {
    platform: Mutex<Platform>,
    writer: Mutex<Writer<Migration>>,
}

impl FakeVmService {
    pub fn new(writer: Writer<Migration>) -> Self {
        Self {
            platform: Mutex::new(Platform::default()),
            writer: Mutex::new(writer),
        }
    }

    pub fn with_vm(self, vm: VirtualMachine) -> Self {
        self.platform.lock().vms.insert(vm.name_any(), vm);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.platform.lock().pods.push(pod);
        self
    }

    pub fn vm(&self, name: &str) -> VirtualMachine {
        self.platform.lock().vms[name].clone()
    }

    pub fn update_vm(&self, name: &str, update: impl FnOnce(&mut VirtualMachine)) {
        if let Some(vm) = self.platform.lock().vms.get_mut(name) {
            update(vm);
        }
    }

    /// Pods created for migrations (target pods and jobs)
    pub fn migration_pods(&self, app: &str) -> Vec<Pod> {
        self.platform
            .lock()
            .pods
            .iter()
            .filter(|p| pod_label(p, MIGRATION_UID_LABEL).is_some())
            .filter(|p| pod_label(p, APP_LABEL) == Some(app))
            .cloned()
            .collect()
    }

    /// Move the target pod of `migration_uid` to `phase` on `node`
    pub fn set_target_pod(&self, migration_uid: &str, phase: PodPhase, node: &str) {
        self.set_pod(VIRT_LAUNCHER_APP, migration_uid, phase, node);
    }

    /// Move the migration job of `migration_uid` to `phase`
    pub fn set_job(&self, migration_uid: &str, phase: PodPhase) {
        self.set_pod(MIGRATION_APP, migration_uid, phase, "");
    }

    fn set_pod(&self, app: &str, migration_uid: &str, phase: PodPhase, node: &str) {
        let mut platform = self.platform.lock();
        for pod in platform.pods.iter_mut() {
            if pod_label(pod, APP_LABEL) == Some(app)
                && pod_label(pod, MIGRATION_UID_LABEL) == Some(migration_uid)
            {
                place_pod(pod, phase, node);
            }
        }
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.platform.lock().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.platform.lock().mutations.len()
    }
}

fn owned_by(pod: &Pod, migration: &Migration, app: &str) -> bool {
    let uid = migration.uid().unwrap_or_default();
    pod_label(pod, APP_LABEL) == Some(app) && pod_label(pod, MIGRATION_UID_LABEL) == Some(&uid)
}

#[async_trait]
impl VmService for FakeVmService {
    async fn fetch_vm(&self, _namespace: &str, name: &str) -> Result<Option<VirtualMachine>, Error> {
        Ok(self.platform.lock().vms.get(name).cloned())
    }

    async fn get_running_vm_pods(&self, vm: &VirtualMachine) -> Result<Vec<Pod>, Error> {
        // Round trip: lets a concurrent pass run in between
        tokio::task::yield_now().await;
        let name = vm.name_any();
        Ok(self
            .platform
            .lock()
            .pods
            .iter()
            .filter(|p| pod_label(p, APP_LABEL) == Some(VIRT_LAUNCHER_APP))
            .filter(|p| pod_label(p, DOMAIN_LABEL) == Some(name.as_str()))
            .filter(|p| !crate::crd::pod::pod_phase(p).is_terminal())
            .cloned()
            .collect())
    }

    async fn create_migration_target_pod(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
    ) -> Result<(), Error> {
        tokio::task::yield_now().await;
        let mut platform = self.platform.lock();
        platform.mutations.push(Mutation::CreateTargetPod {
            migration: migration.name_any(),
        });
        if platform
            .pods
            .iter()
            .any(|p| owned_by(p, migration, VIRT_LAUNCHER_APP))
        {
            return Ok(());
        }
        let pod = target_pod(migration, &vm.name_any(), PodPhase::Pending, "");
        platform.pods.push(pod);
        Ok(())
    }

    async fn start_migration(
        &self,
        migration: &Migration,
        vm: &VirtualMachine,
        source: &Node,
        target: &Node,
        _target_pod: &Pod,
    ) -> Result<(), Error> {
        let uid = migration.uid().unwrap_or_default();
        let name = migration.name_any();
        let mut job = pod_with_labels(
            &format!("virt-migration-{name}"),
            &[
                (APP_LABEL, MIGRATION_APP),
                (DOMAIN_LABEL, &vm.name_any()),
                (MIGRATION_LABEL, &name),
                (MIGRATION_UID_LABEL, &uid),
            ],
        );
        place_pod(&mut job, PodPhase::Pending, "");

        let mut platform = self.platform.lock();
        platform.mutations.push(Mutation::StartMigration {
            migration: name,
            source: source.name_any(),
            target: target.name_any(),
        });
        platform.pods.push(job);
        Ok(())
    }

    async fn get_migration_job(&self, migration: &Migration) -> Result<Option<Pod>, Error> {
        Ok(self
            .platform
            .lock()
            .pods
            .iter()
            .find(|p| owned_by(p, migration, MIGRATION_APP))
            .cloned())
    }

    async fn update_migration(&self, migration: &Migration) -> Result<(), Error> {
        self.platform.lock().mutations.push(Mutation::UpdateMigration {
            migration: migration.name_any(),
            phase: migration.phase(),
        });
        self.writer
            .lock()
            .apply_watcher_event(&watcher::Event::Apply(migration.clone()));
        Ok(())
    }

    async fn put_vm(&self, vm: &VirtualMachine) -> Result<VirtualMachine, Error> {
        let mut platform = self.platform.lock();
        platform.mutations.push(Mutation::PutVm {
            vm: vm.name_any(),
            phase: vm.phase(),
            node: vm.node_name().to_string(),
            migration_node: vm.migration_node_name().to_string(),
        });
        platform.vms.insert(vm.name_any(), vm.clone());
        Ok(vm.clone())
    }
}

/// Nodes `node-<x>` with address `10.0.0.<n>`
pub struct FakeClusterClient;

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, Error> {
        let last = name.bytes().last().unwrap_or(b'a');
        Ok(node(name, Some(&format!("10.0.0.{}", last))))
    }
}
