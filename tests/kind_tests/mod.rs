//! Integration tests for the migration controller
//!
//! Tests tell the story of a cluster operator moving VMs around.
//!
//! # Test Organization
//!
//! - `crd_operations`: creating, reading, updating and deleting Migration and
//!   VirtualMachine resources through the Kubernetes API
//!
//! - `migration_lifecycle`: the running controller reacting to Migrations
//!   (target pod creation and the failure paths that need no real hypervisor)

mod crd_operations;
