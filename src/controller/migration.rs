//! Migration reconciler
//!
//! Drives one Migration from `Unknown` through `Running` to a terminal phase,
//! moving its VM along `Running -> Migrating -> Running`. A pass reads the
//! current world, takes the next step and returns; the next event or retry
//! continues from whatever state that step left behind.
//!
//! ```text
//!  Unknown ──create target pod──► Running ──job Succeeded──► Succeeded
//!     │                              │
//!     └──(no VM, VM not Running,     └──(target pod lost or ended,
//!         other migration active,        job Failed)──► Failed
//!         target pod Failed)──► Failed
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use kube::runtime::controller::Action;
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use super::constraints::merge_constraints;
use super::service::{ClusterClient, VmService};
use super::situation::investigate_target_pods;
use super::vm_lock::VmLocks;
use crate::crd::pod::{pod_node_name, pod_phase, NODE_NAME_LABEL};
use crate::crd::{Migration, MigrationPhase, PodPhase, VirtualMachine, VmPhase};
use crate::retry::BackoffConfig;
use crate::Error;

/// Shared state for every reconciliation
pub struct Context {
    /// VM platform operations
    pub vm_service: Arc<dyn VmService>,
    /// Node lookups
    pub cluster: Arc<dyn ClusterClient>,
    /// Read-only view of all Migrations, fed by the controller's watch
    pub migrations: Store<Migration>,
    /// Serializes reconciliations touching the same VM
    pub vm_locks: VmLocks,
    /// Requeue delays for failing Migrations
    pub backoff: BackoffConfig,
    /// Consecutive failures per Migration key, cleared on success
    failures: DashMap<String, u32>,
}

impl Context {
    /// Create a new controller context
    pub fn new(
        vm_service: Arc<dyn VmService>,
        cluster: Arc<dyn ClusterClient>,
        migrations: Store<Migration>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            vm_service,
            cluster,
            migrations,
            vm_locks: VmLocks::new(),
            backoff,
            failures: DashMap::new(),
        }
    }
}

/// Reconcile one Migration.
///
/// Terminal Migrations are never touched again. Errors mean "retry later";
/// state already written by this pass is picked up on the next one. The
/// runtime drops Migrations deleted before their pass starts.
#[instrument(skip(migration, ctx), fields(migration = %migration.key()))]
pub async fn reconcile(migration: Arc<Migration>, ctx: Arc<Context>) -> Result<Action, Error> {
    reconcile_migration(&migration, &ctx).await?;
    ctx.failures.remove(&migration.key());
    Ok(Action::await_change())
}

/// Requeue a failed Migration after a delay that grows with each failure
pub fn error_policy(migration: Arc<Migration>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = migration.key();
    let previous = {
        let mut count = ctx.failures.entry(key.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    };
    let delay = ctx.backoff.delay_for(previous);

    warn!(
        ?error,
        migration = %key,
        retries = previous + 1,
        delay_ms = delay.as_millis() as u64,
        "reconciliation failed, requeuing"
    );

    Action::requeue(delay)
}

async fn reconcile_migration(cached: &Migration, ctx: &Context) -> Result<(), Error> {
    // The cached object is shared with the watch and other workers
    let mut migration = cached.clone();

    if migration.phase().is_terminal() {
        debug!(phase = %migration.phase(), "migration already finished");
        return Ok(());
    }

    let namespace = migration.namespace().unwrap_or_default();
    let vm_name = migration.vm_name().to_string();
    let _vm_guard = ctx.vm_locks.lock(&format!("{namespace}/{vm_name}")).await;

    let Some(vm) = ctx.vm_service.fetch_vm(&namespace, &vm_name).await? else {
        info!(vm = %vm_name, "VM of migration does not exist");
        return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
    };

    match migration.phase() {
        MigrationPhase::Unknown => reconcile_unknown(ctx, migration, vm).await,
        MigrationPhase::Running => reconcile_running(ctx, migration, vm).await,
        MigrationPhase::Succeeded | MigrationPhase::Failed => Ok(()),
    }
}

/// Start a migration: validate the VM and request a target pod.
async fn reconcile_unknown(
    ctx: &Context,
    mut migration: Migration,
    mut vm: VirtualMachine,
) -> Result<(), Error> {
    if vm.phase() != VmPhase::Running {
        error!(vm = %vm.name_any(), vm_phase = %vm.phase(), "VM is not running, cannot migrate");
        return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
    }

    // In-memory only; persisted with the VM once the target pod runs
    if let Err(e) = merge_constraints(&migration, &mut vm) {
        error!(error = %e, "migration constraints conflict with the VM");
        return Err(e);
    }

    let pods = ctx.vm_service.get_running_vm_pods(&vm).await?;
    let situation = investigate_target_pods(&migration, &pods, &ctx.migrations);

    match situation.target_pod {
        None if situation.pod_count > 0 => {
            error!(
                active_pods = situation.pod_count,
                "another migration seems to be in progress"
            );
            return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
        }
        None => {
            ctx.vm_service
                .create_migration_target_pod(&migration, &vm)
                .await?;
        }
        Some(pod) if pod_phase(&pod) == PodPhase::Failed => {
            error!(pod = %pod.name_any(), "migration target pod failed");
            return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
        }
        Some(pod) => {
            info!(pod = %pod.name_any(), "target pod exists but migration was not marked Running");
        }
    }

    set_migration_phase(ctx, &mut migration, MigrationPhase::Running).await
}

/// Advance a running migration by one step.
async fn reconcile_running(
    ctx: &Context,
    mut migration: Migration,
    mut vm: VirtualMachine,
) -> Result<(), Error> {
    let pods = ctx.vm_service.get_running_vm_pods(&vm).await?;
    let situation = investigate_target_pods(&migration, &pods, &ctx.migrations);

    let Some(target_pod) = situation.target_pod else {
        error!("migration target pod vanished");
        // Nobody else can own a Migrating VM when no migration pod is active
        if vm.phase() == VmPhase::Migrating && situation.pod_count == 0 {
            rollback_vm(ctx, &mut vm).await?;
        }
        return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
    };
    let target_node = pod_node_name(&target_pod).to_string();

    match pod_phase(&target_pod) {
        PodPhase::Running => {}
        phase @ (PodPhase::Succeeded | PodPhase::Failed) => {
            error!(pod = %target_pod.name_any(), pod_phase = %phase, "migration target pod ended");
            if vm.phase() == VmPhase::Migrating && vm.migration_node_name() == target_node {
                rollback_vm(ctx, &mut vm).await?;
            }
            return set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await;
        }
        phase => {
            debug!(pod = %target_pod.name_any(), pod_phase = %phase, "waiting for target pod");
            return Ok(());
        }
    }

    // Committed by an earlier pass the cache has not caught up with yet
    if vm.phase() == VmPhase::Running
        && vm.node_name() == target_node
        && vm.migration_node_name().is_empty()
    {
        info!(vm = %vm.name_any(), node = %target_node, "VM already on target node");
        return set_migration_phase(ctx, &mut migration, MigrationPhase::Succeeded).await;
    }

    if vm.migration_node_name() != target_node {
        merge_constraints(&migration, &mut vm)?;
        let status = vm.status_mut();
        status.phase = VmPhase::Migrating;
        status.migration_node_name = target_node.clone();
        vm = ctx.vm_service.put_vm(&vm).await?;
        info!(vm = %vm.name_any(), target_node = %target_node, "VM marked as migrating");
    }

    let Some(job) = ctx.vm_service.get_migration_job(&migration).await? else {
        let source = ctx.cluster.get_node(vm.node_name()).await?;
        let target = ctx.cluster.get_node(vm.migration_node_name()).await?;
        ctx.vm_service
            .start_migration(&migration, &vm, &source, &target, &target_pod)
            .await?;
        return Ok(());
    };

    match pod_phase(&job) {
        PodPhase::Succeeded => {
            commit_vm(ctx, &mut vm, &target_node).await?;
            info!(vm = %vm.name_any(), node = %target_node, "migration succeeded");
            set_migration_phase(ctx, &mut migration, MigrationPhase::Succeeded).await
        }
        PodPhase::Failed => {
            error!(job = %job.name_any(), "migration job failed");
            rollback_vm(ctx, &mut vm).await?;
            set_migration_phase(ctx, &mut migration, MigrationPhase::Failed).await
        }
        phase => {
            debug!(job = %job.name_any(), job_phase = %phase, "migration job in progress");
            Ok(())
        }
    }
}

/// Write `phase` unless the Migration is already there or already finished.
async fn set_migration_phase(
    ctx: &Context,
    migration: &mut Migration,
    phase: MigrationPhase,
) -> Result<(), Error> {
    let current = migration.phase();
    if current == phase {
        return Ok(());
    }
    if current.is_terminal() {
        warn!(%current, requested = %phase, "refusing to leave a terminal phase");
        return Ok(());
    }

    migration.set_phase(phase);
    ctx.vm_service.update_migration(migration).await?;
    info!(from = %current, to = %phase, "migration phase changed");
    Ok(())
}

/// Move the VM to its new node and end the migrating state.
async fn commit_vm(ctx: &Context, vm: &mut VirtualMachine, target_node: &str) -> Result<(), Error> {
    vm.labels_mut()
        .insert(NODE_NAME_LABEL.to_string(), target_node.to_string());
    let status = vm.status_mut();
    status.phase = VmPhase::Running;
    status.node_name = target_node.to_string();
    status.migration_node_name.clear();
    ctx.vm_service.put_vm(vm).await?;
    Ok(())
}

/// Return the VM to running on its source node.
async fn rollback_vm(ctx: &Context, vm: &mut VirtualMachine) -> Result<(), Error> {
    let status = vm.status_mut();
    status.phase = VmPhase::Running;
    status.migration_node_name.clear();
    ctx.vm_service.put_vm(vm).await?;
    info!(vm = %vm.name_any(), node = %vm.node_name(), "VM rolled back to source node");
    Ok(())
}
