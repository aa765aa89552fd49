//! watchkeeper -- lifecycle reconciliation daemon.
//!
//! Tracks components, monitorings, tasks and plans, and drives each through
//! a status machine by periodically calling pluggable controllers (SSH,
//! cluster orchestration, metrics queries).

pub mod api;
pub mod config;
pub mod controller;
pub mod core;
pub mod logging;
pub mod model;
pub mod registry;
pub mod scheduler;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::controller::{
    ClusterController, HostKeyPolicy, MonitorControllers, PromQlController, ResourceControllers,
    SshController,
};
use crate::scheduler::Watchdog;

/// Built-in controllers, configured from `config`.
pub fn builtin_controllers(config: &Config) -> (ResourceControllers, MonitorControllers) {
    let mut resources = ResourceControllers::new();
    resources.register(
        "ssh",
        Arc::new(SshController::new(
            Duration::from_millis(config.ssh.connect_timeout_ms),
            HostKeyPolicy {
                known_hosts: config.ssh.known_hosts.clone(),
                accept_unknown: config.ssh.accept_unknown_hosts,
            },
        )),
    );
    resources.register(
        "cluster",
        Arc::new(ClusterController::new(Duration::from_millis(
            config.cluster.simulated_delay_ms,
        ))),
    );

    let mut monitors = MonitorControllers::new();
    monitors.register(
        "promql",
        Arc::new(PromQlController::new(
            config.metrics.api_url.clone(),
            Duration::from_millis(config.metrics.default_timeout_ms),
        )),
    );

    (resources, monitors)
}

/// Start the daemon: watchdogs plus the HTTP control plane. Returns after
/// `shutdown` fires and background work has drained.
pub async fn serve(config: Config, shutdown: CancellationToken) -> Result<()> {
    if config.ssh.accept_unknown_hosts {
        tracing::warn!("ssh host key verification disabled for unpinned hosts");
    }

    let (resources, monitors) = builtin_controllers(&config);
    let core = Arc::new(crate::core::Core::new(resources, monitors, shutdown.clone()));
    let wd = &config.watchdog;

    let watchdogs = vec![
        tokio::spawn(
            Watchdog::new(
                Arc::new(core.component_reconciler()),
                wd.options(&wd.components),
            )
            .run(shutdown.clone()),
        ),
        tokio::spawn(
            Watchdog::new(
                Arc::new(core.monitoring_reconciler()),
                wd.options(&wd.monitorings),
            )
            .run(shutdown.clone()),
        ),
        tokio::spawn(
            Watchdog::new(Arc::new(core.task_reconciler()), wd.options(&wd.tasks))
                .run(shutdown.clone()),
        ),
    ];

    let app = api::router(api::state::AppState::new(core.clone()));
    let listener = tokio::net::TcpListener::bind(&config.server.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_address))?;
    tracing::info!(addr = %config.server.listen_address, "watchkeeper listening");

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // The server only returns early on shutdown; make sure the rest follows.
    shutdown.cancel();
    for handle in watchdogs {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "watchdog task panicked");
        }
    }
    if !core
        .drain_runs(Duration::from_millis(config.watchdog.drain_timeout_ms))
        .await
    {
        tracing::warn!("runs still in progress at shutdown");
    }

    tracing::info!("watchkeeper stopped");
    Ok(())
}
