//! Resource types the migration controller reads and writes
//!
//! `Migration` and `VirtualMachine` are custom resources of the VM platform;
//! pods are plain core/v1 objects identified by label conventions.

mod migration;
pub mod pod;
mod vm;

pub use migration::{Migration, MigrationPhase, MigrationSpec, MigrationStatus, VmSelector};
pub use pod::PodPhase;
pub use vm::{VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmPhase};
