//! The composition root: assembles storage, the worktree manager, the
//! secret store, the event hub, and the agent runner into a single
//! [`TaskOrchestrator`], then serves it over HTTP until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use ao_agents::orchestrator::TaskOrchestrator;
use ao_agents::runner::AgentRunner;
use ao_core::config::Config;
use ao_core::event_hub::EventHub;
use ao_core::secret_store::SecretStore;
use ao_core::task_store::TaskStore;
use ao_core::worktree_manager::WorktreeManager;
use ao_harness::process_supervisor::ProcessSupervisor;
use ao_harness::shutdown::ShutdownSignal;
use tokio::net::TcpListener;
use tracing::info;

/// Everything the server needs, built once in [`Daemon::new`] and handed
/// to the router for the lifetime of the process.
pub struct Daemon {
    config: Arc<Config>,
    orchestrator: Arc<TaskOrchestrator>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create every data directory `config` names, open the stores, and wire
    /// them into a [`TaskOrchestrator`].
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        for dir in [
            &config.data_dir,
            &config.repos_base_dir,
            &config.worktrees_dir,
            &config.secrets_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }

        let store = Arc::new(
            TaskStore::open(config.tasks_db_path())
                .await
                .context("failed to open task store")?,
        );
        let worktrees = Arc::new(WorktreeManager::new(
            config.repos_base_dir.clone(),
            config.worktrees_dir.clone(),
        ));
        let secrets = Arc::new(
            SecretStore::open(config.secrets_dir.clone()).context("failed to open secret store")?,
        );
        let events = Arc::new(EventHub::new());
        let runner = Arc::new(AgentRunner::new(
            ProcessSupervisor::new(),
            config.event_heartbeat_secs,
            config.agent_timeout_secs,
        ));

        let orchestrator = Arc::new(TaskOrchestrator::new(
            store,
            worktrees,
            runner,
            events,
            secrets,
            config.clone(),
        ));

        Ok(Self {
            config,
            orchestrator,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    /// A handle callers can use to trigger or observe shutdown.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the HTTP API on `listener` until the shutdown signal fires.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<()> {
        let router = ao_bridge::http_api::router(self.orchestrator.clone(), self.config.clone())
            .layer(axum::middleware::from_fn(
                ao_telemetry::middleware::request_metrics_middleware,
            ))
            .layer(axum::middleware::from_fn(
                ao_telemetry::tracing_setup::request_id_middleware,
            ));

        let addr = listener.local_addr().context("listener has no local address")?;
        info!(%addr, "API server listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("graceful shutdown engaged");
            })
            .await
            .context("API server error")?;

        Ok(())
    }
}
