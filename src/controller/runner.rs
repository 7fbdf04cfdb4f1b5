//! Controller runner
//!
//! Builds the kube controller for Migrations. The runtime owns the work
//! queue: it dedups keys, never runs one key twice at once, waits for the
//! Migration cache before the first pass and requeues failures through
//! [`error_policy`].

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Config};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, Controller};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::migration::{error_policy, reconcile, Context};
use super::service::{ClusterClient, VmService};
use crate::config::ControllerConfig;
use crate::crd::Migration;
use crate::retry::BackoffConfig;
use crate::watch::{
    finished_job_trigger, job_watch_config, migration_watch_config, running_target_pod_trigger,
    target_pod_watch_config,
};
use crate::Error;

/// Live-migration controller for one namespace
pub struct MigrationController {
    client: Client,
    namespace: String,
    vm_service: Arc<dyn VmService>,
    cluster: Arc<dyn ClusterClient>,
    backoff: BackoffConfig,
}

impl MigrationController {
    /// Create a controller; nothing runs until [`MigrationController::run`]
    pub fn new(
        vm_service: Arc<dyn VmService>,
        cluster: Arc<dyn ClusterClient>,
        client: Client,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            namespace: config.namespace,
            vm_service,
            cluster,
            backoff: config.backoff,
        }
    }

    /// Run with `threadiness` concurrent reconciliations until `cancel` fires.
    ///
    /// In-flight passes finish before this returns.
    pub async fn run(self, threadiness: usize, cancel: CancellationToken) {
        info!(namespace = %self.namespace, threadiness, "starting migration controller");

        let migrations: Api<Migration> = Api::namespaced(self.client.clone(), &self.namespace);
        let pods: Api<Pod> = Api::namespaced(self.client, &self.namespace);

        let controller = Controller::new(migrations, migration_watch_config())
            .with_config(Config::default().concurrency(worker_concurrency(threadiness)))
            .watches(
                pods.clone(),
                target_pod_watch_config(),
                running_target_pod_trigger,
            )
            .watches(pods, job_watch_config(), finished_job_trigger)
            .graceful_shutdown_on(cancel.cancelled_owned());

        let ctx = Arc::new(Context::new(
            self.vm_service,
            self.cluster,
            controller.store(),
            self.backoff,
        ));

        controller
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result)
            .await;

        info!("migration controller stopped");
    }
}

/// Concurrent reconciliations for `threadiness` workers; at least one
pub fn worker_concurrency(threadiness: usize) -> u16 {
    u16::try_from(threadiness.max(1)).unwrap_or(u16::MAX)
}

type ReconcileResult =
    Result<(ObjectRef<Migration>, Action), controller::Error<Error, watcher::Error>>;

fn log_reconcile_result(result: ReconcileResult) -> std::future::Ready<()> {
    match result {
        Ok((migration, action)) => {
            tracing::debug!(%migration, ?action, "Migration reconciliation completed")
        }
        // Deleted between the trigger and the pass
        Err(controller::Error::ObjectNotFound(migration)) => {
            tracing::debug!(%migration, "Migration no longer exists")
        }
        Err(e) => tracing::error!(error = ?e, "Migration reconciliation error"),
    }
    std::future::ready(())
}
