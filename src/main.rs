//! Virt Migration Controller - live-migrates VMs between cluster nodes

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use virt_migration_controller::config::{ControllerArgs, ControllerConfig};
use virt_migration_controller::controller::{
    KubeClusterClient, KubeVmService, MigrationController,
};
use virt_migration_controller::crd::{Migration, VirtualMachine};
use virt_migration_controller::telemetry::init_tracing;

/// Virt Migration Controller - moves running VMs to other nodes on request
#[derive(Parser, Debug)]
#[command(name = "virt-migration-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let migration = serde_yaml::to_string(&Migration::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Migration CRD: {}", e))?;
        let vm = serde_yaml::to_string(&VirtualMachine::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize VirtualMachine CRD: {}", e))?;
        println!("{migration}---\n{vm}");
        return Ok(());
    }

    init_tracing(cli.controller.log_format)?;

    let config = ControllerConfig::from(&cli.controller);
    let client = build_client(cli.controller.kubeconfig.as_deref()).await?;

    let vm_service = Arc::new(KubeVmService::new(
        client.clone(),
        &config.launcher_image,
        &config.migrator_image,
    ));
    let cluster = Arc::new(KubeClusterClient::new(client.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let threadiness = config.threadiness;
    MigrationController::new(vm_service, cluster, client, config)
        .run(threadiness, cancel)
        .await;

    Ok(())
}

/// Client from an explicit kubeconfig, or in-cluster/default config
async fn build_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e));
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {}: {}", path.display(), e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Invalid kubeconfig {}: {}", path.display(), e))?;
    Client::try_from(config).map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}
