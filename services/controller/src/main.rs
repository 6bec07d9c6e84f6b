//! runnerpool controller
//!
//! Keeps a minimum number of ephemeral GitHub Actions runners alive as
//! Proxmox VMs and serves the cloud-init documents they boot from.

use std::sync::Arc;

use anyhow::Result;
use runnerpool_controller::{
    api,
    config::Config,
    hypervisor::ProxmoxClient,
    lifecycle::{CloneSettings, LifecycleEngine},
    reconciler::{Reconciler, ReconcilerSettings},
    registration::Registrar,
    registry::GitHubClient,
    state::AppState,
    template::BootTemplate,
    token::ProvisioningTokens,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting runnerpool controller");
    info!(
        node = %config.proxmox.node,
        pool = %config.proxmox.pool,
        min_vmid = config.proxmox.min_vmid,
        max_vmid = config.proxmox.max_vmid,
        minimum_runners = config.minimum_runners,
        "Configuration loaded"
    );

    let template = BootTemplate::load(config.cloud_init_template.as_deref())?;
    let tokens = ProvisioningTokens::new(config.jwt_secret.clone(), config.token_ttl);

    let hypervisor = Arc::new(ProxmoxClient::new(&config.proxmox)?);
    let registry = Arc::new(GitHubClient::new(&config.github, config.github.auth.load()?)?);
    let registrar = Registrar::new(registry, config.runner_labels(), config.github.runner_group_id);

    let lifecycle = LifecycleEngine::new(
        hypervisor.clone(),
        tokens.clone(),
        CloneSettings {
            node: config.proxmox.node.clone(),
            pool: config.proxmox.pool.clone(),
            template_vmid: config.proxmox.template_vmid,
            full_clone: config.proxmox.full_clone,
            name_prefix: config.runner_name_prefix.clone(),
        },
        config.public_url.clone(),
        config.lifecycle,
        config.task_wait,
    );
    let reconciler = Reconciler::new(
        hypervisor,
        lifecycle,
        ReconcilerSettings {
            pool: config.proxmox.pool.clone(),
            min_vmid: config.proxmox.min_vmid,
            max_vmid: config.proxmox.max_vmid,
            minimum_runners: config.minimum_runners,
            member_failure_policy: config.member_failure_policy,
            interval: config.reconcile_interval,
        },
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(tokens, registrar, template));

    let listen_addr = (config.host.as_str(), config.port);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listener.local_addr()?, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // A pass in progress is not drained; give it a moment to reach a task
    // boundary before exiting.
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if tokio::time::timeout(shutdown_timeout, reconciler_handle)
        .await
        .is_err()
    {
        warn!("Reconciliation worker did not shut down in time");
    }

    info!("Controller shutdown complete");
    Ok(())
}
