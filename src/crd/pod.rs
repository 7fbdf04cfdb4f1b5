//! Label conventions and helpers for the pods the controller coordinates
//!
//! Two kinds of pods matter for a migration:
//! - the target pod (`app=virt-launcher`), which hosts the VM on its new node
//! - the migration job (`app=migration`), which performs the memory transfer
//!
//! Both are tied back to their Migration through the `migration` (name) and
//! `migration-uid` labels.

use k8s_openapi::api::core::v1::Pod;

/// Label naming the component a pod belongs to
pub const APP_LABEL: &str = "kubevirt.io/app";
/// Label naming the VM (domain) a pod belongs to
pub const DOMAIN_LABEL: &str = "kubevirt.io/domain";
/// Label naming the Migration a pod was created for
pub const MIGRATION_LABEL: &str = "kubevirt.io/migration";
/// Label pinning a pod to one specific Migration by UID
pub const MIGRATION_UID_LABEL: &str = "kubevirt.io/migration-uid";
/// VM label recording the node the VM currently runs on
pub const NODE_NAME_LABEL: &str = "kubevirt.io/nodeName";

/// `app` value of pods hosting a VM
pub const VIRT_LAUNCHER_APP: &str = "virt-launcher";
/// `app` value of migration job pods
pub const MIGRATION_APP: &str = "migration";

/// Well-known node label used for anti-affinity against the source node
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Pod lifecycle phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted, waiting for scheduling or image pulls
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers exited successfully
    Succeeded,
    /// At least one container failed
    Failed,
    /// State could not be obtained
    Unknown,
}

impl PodPhase {
    /// Parse the phase string from `status.phase`
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Succeeded and Failed pods never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The value as written in `status.phase`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of a pod; a pod without status is `Unknown`
pub fn pod_phase(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Node the scheduler assigned the pod to (empty while unscheduled)
pub fn pod_node_name(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default()
}

/// Value of a label on the pod, if present
pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}
