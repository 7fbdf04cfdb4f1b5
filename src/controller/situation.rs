//! Target-pod situation analysis
//!
//! Given the live pods of a VM, find the pod that belongs to the Migration
//! being reconciled and count the pods that stand for migrations still in
//! flight. The count enforces at-most-one active migration per VM.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use crate::crd::pod::{pod_label, MIGRATION_LABEL, MIGRATION_UID_LABEL};
use crate::crd::Migration;

/// Pods of a VM as seen from one Migration
#[derive(Clone, Debug, Default)]
pub struct TargetPodSituation {
    /// Pods representing active migrations, including our own target pod
    pub pod_count: usize,
    /// The pod labelled with this Migration's UID
    pub target_pod: Option<Pod>,
}

/// Classify `pods` relative to `migration`.
///
/// - a pod carrying `migration-uid == migration.uid` is our target pod
/// - a pod without a `migration` label is the VM's original pod and is skipped
/// - a pod whose Migration is terminal in `migrations` is skipped
/// - a pod whose Migration is live, or unknown to the cache, counts
///
/// If two pods claim the same UID the last one wins.
pub fn investigate_target_pods(
    migration: &Migration,
    pods: &[Pod],
    migrations: &Store<Migration>,
) -> TargetPodSituation {
    let uid = migration.uid().unwrap_or_default();
    let mut situation = TargetPodSituation::default();

    for pod in pods {
        if !uid.is_empty() && pod_label(pod, MIGRATION_UID_LABEL) == Some(uid.as_str()) {
            situation.target_pod = Some(pod.clone());
            situation.pod_count += 1;
            continue;
        }

        let Some(owner) = pod_label(pod, MIGRATION_LABEL) else {
            continue;
        };

        let namespace = pod.namespace().unwrap_or_default();
        let owner_ref = ObjectRef::<Migration>::new(owner).within(&namespace);
        match migrations.get(&owner_ref) {
            Some(cached) if cached.phase().is_terminal() => {}
            // Unknown owners count: the cache may not have seen them finish yet
            _ => situation.pod_count += 1,
        }
    }

    situation
}
