//! Migration controller
//!
//! The reconciler in [`migration`] owns the state machine. It reads and
//! writes the cluster only through the traits in [`service`], consults the
//! helpers in [`situation`] and [`constraints`], and serializes work per VM
//! with [`vm_lock`]. [`runner`] runs it under the kube controller runtime.

pub mod constraints;
pub mod migration;
pub mod runner;
pub mod service;
pub mod situation;
pub mod vm_lock;

#[cfg(test)]
pub(crate) mod test_fixtures;

pub use migration::{error_policy, reconcile, Context};
pub use runner::MigrationController;
pub use service::{ClusterClient, KubeClusterClient, KubeVmService, VmService};
