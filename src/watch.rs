//! Watch configuration and trigger mappings
//!
//! The controller watches three things:
//!
//! - Migrations, mirrored into the store the reconciler reads
//! - running target pods, which unblock the `Running` phase
//! - finished migration jobs, which end it
//!
//! Pod events are mapped to the Migration named by the pod's `migration`
//! label. The reconciler re-reads state, so a dropped or duplicated trigger
//! is harmless.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;

use crate::crd::pod::{
    pod_label, pod_phase, APP_LABEL, DOMAIN_LABEL, MIGRATION_APP, MIGRATION_LABEL,
    VIRT_LAUNCHER_APP,
};
use crate::crd::{Migration, PodPhase};

/// Server-side watch timeout, kept below the client read timeout
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Label selector for target pods
pub const TARGET_POD_LABELS: &str = "kubevirt.io/migration,kubevirt.io/app in (virt-launcher)";
/// Field selector for target pods
pub const TARGET_POD_FIELDS: &str = "status.phase=Running";
/// Label selector for migration jobs
pub const JOB_LABELS: &str = "kubevirt.io/app=migration,kubevirt.io/domain,kubevirt.io/migration";
/// Field selector for migration jobs that have finished
pub const JOB_FIELDS: &str = "status.phase!=Pending,status.phase!=Running,status.phase!=Unknown";

// =============================================================================
// Event projection
// =============================================================================

/// Migration a pod stands for: its namespace and `migration` label.
///
/// A pod without the label yields an empty name, which never matches a
/// cached Migration.
pub fn migration_key_for_pod(pod: &Pod) -> ObjectRef<Migration> {
    let name = pod_label(pod, MIGRATION_LABEL).unwrap_or_default();
    ObjectRef::new(name).within(&pod.namespace().unwrap_or_default())
}

/// A scheduled target pod that may let a migration proceed
pub fn is_running_target_pod(pod: &Pod) -> bool {
    pod_label(pod, APP_LABEL) == Some(VIRT_LAUNCHER_APP)
        && pod_label(pod, MIGRATION_LABEL).is_some()
        && pod_phase(pod) == PodPhase::Running
}

/// A migration job that has reached an end state
pub fn is_finished_migration_job(pod: &Pod) -> bool {
    pod_label(pod, APP_LABEL) == Some(MIGRATION_APP)
        && pod_label(pod, DOMAIN_LABEL).is_some()
        && pod_label(pod, MIGRATION_LABEL).is_some()
        && !matches!(
            pod_phase(pod),
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown
        )
}

/// Trigger for the target pod watch
pub fn running_target_pod_trigger(pod: Pod) -> Option<ObjectRef<Migration>> {
    is_running_target_pod(&pod).then(|| migration_key_for_pod(&pod))
}

/// Trigger for the migration job watch
pub fn finished_job_trigger(pod: Pod) -> Option<ObjectRef<Migration>> {
    is_finished_migration_job(&pod).then(|| migration_key_for_pod(&pod))
}

// =============================================================================
// Watch configuration
// =============================================================================

/// Watch config for Migrations
pub fn migration_watch_config() -> watcher::Config {
    watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch config for running target pods
pub fn target_pod_watch_config() -> watcher::Config {
    watcher::Config::default()
        .labels(TARGET_POD_LABELS)
        .fields(TARGET_POD_FIELDS)
        .timeout(WATCH_TIMEOUT_SECS)
}

/// Watch config for finished migration jobs
pub fn job_watch_config() -> watcher::Config {
    watcher::Config::default()
        .labels(JOB_LABELS)
        .fields(JOB_FIELDS)
        .timeout(WATCH_TIMEOUT_SECS)
}
