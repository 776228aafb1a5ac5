use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Json, Router, response::IntoResponse, routing::get};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::config::{NamespaceBackendKind, ShipyardToml};

use super::docker::DockerNamespaces;
use super::executor::{ExecutorSettings, OperationExecutor};
use super::namespace::{LocalNamespaces, NamespaceBackend, NamespaceManager};
use super::orchestrator::Services;
use super::sandbox::LocalSandbox;
use super::state::ProjectLocks;
use super::ws;

/// Configuration for the session server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub namespace_backend: NamespaceBackendKind,
    pub workspace_root: PathBuf,
    pub settings: ShipyardToml,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_toml(ShipyardToml::default())
    }
}

impl ServerConfig {
    pub fn from_toml(settings: ShipyardToml) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            dev_mode: settings.server.dev_mode,
            namespace_backend: settings.namespace.backend,
            workspace_root: settings.namespace.workspace_root.clone(),
            settings,
        }
    }
}

/// Build the router: WebSocket sessions plus a health probe.
pub fn build_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health))
        .with_state(services)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Wire the namespace backend, sandbox and executor described by `config`.
pub async fn build_services(config: &ServerConfig) -> Result<Arc<Services>> {
    std::fs::create_dir_all(&config.workspace_root).with_context(|| {
        format!(
            "Failed to create workspace root {}",
            config.workspace_root.display()
        )
    })?;

    let backend: Arc<dyn NamespaceBackend> = match config.namespace_backend {
        NamespaceBackendKind::Local => Arc::new(LocalNamespaces::new(&config.workspace_root)),
        NamespaceBackendKind::Docker => Arc::new(
            DockerNamespaces::connect(&config.workspace_root)
                .await
                .context("Docker namespace backend unavailable")?,
        ),
    };

    let settings = &config.settings;
    let locks = ProjectLocks::new();
    let executor = OperationExecutor::new(
        Arc::new(LocalSandbox::new()),
        Arc::clone(&backend),
        locks.clone(),
        ExecutorSettings {
            command_timeout: settings.command_timeout(),
            launch_grace: settings.launch_grace(),
            service_port: settings.deploy.service_port,
            domain_suffix: settings.deploy.domain_suffix.clone(),
        },
    );
    let namespaces = NamespaceManager::new(backend, locks, settings.ready_timeout());

    Ok(Arc::new(Services::new(
        namespaces,
        executor,
        settings.execution.event_log_capacity,
    )))
}

/// Start the session server and run until Ctrl-C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let services = build_services(&config).await?;
    let mut app = build_router(Arc::clone(&services));

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        backend = services.namespaces.backend().name(),
        "Shipyard listening"
    );
    println!("Shipyard running at ws://{}/ws", local_addr);

    let shutdown_services = Arc::clone(&services);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Cancelling sessions lets their socket loops exit, so the
            // graceful shutdown does not wait on open connections.
            shutdown_services.shutdown().await;
        })
        .await
        .context("Server error")?;

    services.shutdown().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
