//! Migration Custom Resource Definition
//!
//! A Migration expresses the intent to move one running VM to another node.
//! The spec is authored by the user and never changes after creation; the
//! controller only ever writes `status.phase`.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a Migration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Not yet looked at by the controller
    #[default]
    Unknown,
    /// A target pod exists (or was requested) and the migration is underway
    Running,
    /// The VM runs on the target node
    Succeeded,
    /// The migration was abandoned; the VM still runs somewhere
    Failed,
}

impl MigrationPhase {
    /// Succeeded and Failed are final: the controller never leaves them
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Selects the VM a Migration applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VmSelector {
    /// Name of the VM in the Migration's namespace
    pub name: String,
}

/// Live migration request for a single VM
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubevirt.io",
    version = "v1alpha1",
    kind = "Migration",
    plural = "migrations",
    namespaced,
    status = "MigrationStatus",
    printcolumn = r#"{"name":"VM","type":"string","jsonPath":".spec.selector.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigrationSpec {
    /// The VM to migrate
    pub selector: VmSelector,

    /// Extra placement constraints for the target node, merged into the VM's
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Status for a Migration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Current phase of the migration lifecycle
    #[serde(default)]
    pub phase: MigrationPhase,
}

impl Migration {
    /// Current phase, `Unknown` when no status has been written yet
    pub fn phase(&self) -> MigrationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Set the phase on this (working copy of the) Migration
    pub fn set_phase(&mut self, phase: MigrationPhase) {
        self.status.get_or_insert_with(Default::default).phase = phase;
    }

    /// Name of the VM this Migration targets
    pub fn vm_name(&self) -> &str {
        &self.spec.selector.name
    }

    /// Work key of the form `namespace/name`
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }
}
