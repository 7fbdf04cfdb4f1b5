//! Virt Migration Controller - live migration of virtual machines between nodes
//!
//! A user creates a `Migration` naming a running `VirtualMachine`. The
//! controller starts a target pod on another node, marks the VM as
//! migrating once that pod runs, launches a migration job, and finally
//! records the VM on its new node or rolls it back to the old one.
//!
//! # Modules
//!
//! - [`crd`] - Migration and VirtualMachine resources, pod label conventions
//! - [`controller`] - Reconciler, cluster-facing services and the runner
//! - [`watch`] - Watch configuration and pod-to-Migration triggers
//! - [`retry`] - Exponential backoff for failed reconciliations
//! - [`config`] - Command-line and environment configuration
//! - [`telemetry`] - Structured logging setup
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod watch;

pub use error::Error;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace watched when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Number of reconciliation workers
pub const DEFAULT_THREADINESS: usize = 3;

/// First retry delay of a failing Migration, in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 5;

/// Upper bound of the retry delay, in seconds
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 1000;

/// Image of the pod that hosts a VM on its target node
pub const DEFAULT_LAUNCHER_IMAGE: &str = "kubevirt/virt-launcher:latest";

/// Image of the pod that performs the live migration
pub const DEFAULT_MIGRATOR_IMAGE: &str = "kubevirt/virt-handler:latest";
