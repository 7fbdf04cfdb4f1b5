//! VirtualMachine Custom Resource Definition
//!
//! The VM record is owned by the VM platform. The migration controller reads
//! it, merges placement constraints into its node selector and moves it
//! through `Running -> Migrating -> Running` while a migration is in flight.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a VM
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum VmPhase {
    /// Accepted but not yet scheduled
    Pending,
    /// Waiting for a node
    Scheduling,
    /// Running on `status.nodeName`
    Running,
    /// Being moved to `status.migrationNodeName`
    Migrating,
    /// Shut down cleanly
    Succeeded,
    /// Crashed or could not start
    Failed,
    /// State could not be determined
    #[default]
    Unknown,
}

impl std::fmt::Display for VmPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Scheduling => write!(f, "Scheduling"),
            Self::Running => write!(f, "Running"),
            Self::Migrating => write!(f, "Migrating"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Specification for a VirtualMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachine",
    plural = "virtualmachines",
    shortname = "vm",
    namespaced,
    status = "VirtualMachineStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Node labels the hosting pod must be scheduled onto
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Status for a VirtualMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Current phase of the VM
    #[serde(default)]
    pub phase: VmPhase,

    /// Node currently hosting the VM
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Target node while migrating, empty otherwise
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub migration_node_name: String,
}

impl VirtualMachine {
    /// Current phase, `Unknown` when no status has been written yet
    pub fn phase(&self) -> VmPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Node currently hosting the VM (empty if unknown)
    pub fn node_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.node_name.as_str())
            .unwrap_or_default()
    }

    /// Target node of an in-flight migration (empty if none)
    pub fn migration_node_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.migration_node_name.as_str())
            .unwrap_or_default()
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut VirtualMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }
}
