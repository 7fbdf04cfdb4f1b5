//! Controller configuration
//!
//! Flags with environment fallbacks, parsed by `clap` in `main` and turned
//! into a [`ControllerConfig`] the runner consumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::retry::BackoffConfig;
use crate::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_LAUNCHER_IMAGE,
    DEFAULT_MIGRATOR_IMAGE, DEFAULT_NAMESPACE, DEFAULT_THREADINESS,
};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable lines
    Text,
}

/// Command-line arguments of the controller
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Namespace whose Migrations, VMs and pods are watched
    #[arg(long, env = "MIGRATION_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "MIGRATION_THREADINESS", default_value_t = DEFAULT_THREADINESS)]
    pub threadiness: usize,

    /// Image of the target pod that hosts the VM after migration
    #[arg(long, env = "VIRT_LAUNCHER_IMAGE", default_value = DEFAULT_LAUNCHER_IMAGE)]
    pub launcher_image: String,

    /// Image of the migration job pod
    #[arg(long, env = "VIRT_MIGRATOR_IMAGE", default_value = DEFAULT_MIGRATOR_IMAGE)]
    pub migrator_image: String,

    /// Path to a kubeconfig; in-cluster or default config otherwise
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// First retry delay of a failing key, in milliseconds
    #[arg(long, default_value_t = DEFAULT_BACKOFF_BASE_MS)]
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay, in seconds
    #[arg(long, default_value_t = DEFAULT_BACKOFF_MAX_SECS)]
    pub backoff_max_secs: u64,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Settings the controller runs with
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Namespace to watch
    pub namespace: String,
    /// Worker count
    pub threadiness: usize,
    /// Target pod image
    pub launcher_image: String,
    /// Migration job image
    pub migrator_image: String,
    /// Retry backoff of failed reconciliations
    pub backoff: BackoffConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            threadiness: DEFAULT_THREADINESS,
            launcher_image: DEFAULT_LAUNCHER_IMAGE.to_string(),
            migrator_image: DEFAULT_MIGRATOR_IMAGE.to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&ControllerArgs> for ControllerConfig {
    fn from(args: &ControllerArgs) -> Self {
        Self {
            namespace: args.namespace.clone(),
            // Zero workers would never reconcile anything
            threadiness: args.threadiness.max(1),
            launcher_image: args.launcher_image.clone(),
            migrator_image: args.migrator_image.clone(),
            backoff: BackoffConfig::new(
                Duration::from_millis(args.backoff_base_ms),
                Duration::from_secs(args.backoff_max_secs),
            ),
        }
    }
}
