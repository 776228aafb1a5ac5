//! Namespace manager: existence check, creation and readiness wait against a
//! `NamespaceBackend`, streamed as `namespace_update` events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::errors::NamespaceError;
use crate::util::namespace_id;

use super::protocol::{Envelope, NamespaceSetup, OperationKind, Status};
use super::state::{ProjectLocks, SessionState};
use super::updates::UpdateBus;

pub const STEP_CHECK: &str = "check_namespace";
pub const STEP_CREATE: &str = "create_namespace";
pub const STEP_WAIT_READY: &str = "wait_ready";

/// Interval between readiness probes.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Abstraction over the namespace runtime.
/// Real implementations: `LocalNamespaces`, `DockerNamespaces`.
#[async_trait]
pub trait NamespaceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn exists(&self, namespace: &str) -> Result<bool>;

    async fn create(&self, namespace: &str, project_id: &str) -> Result<()>;

    async fn is_ready(&self, namespace: &str) -> Result<bool>;

    /// Host directory where operations in this namespace keep their sources.
    fn workdir(&self, namespace: &str) -> PathBuf;
}

/// A namespace is a directory under `root`, ready once it exists.
pub struct LocalNamespaces {
    root: PathBuf,
}

impl LocalNamespaces {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl NamespaceBackend for LocalNamespaces {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn exists(&self, namespace: &str) -> Result<bool> {
        tokio::fs::try_exists(self.workdir(namespace))
            .await
            .with_context(|| format!("Failed to stat namespace directory for {}", namespace))
    }

    async fn create(&self, namespace: &str, project_id: &str) -> Result<()> {
        let dir = self.workdir(namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        tokio::fs::write(dir.join(".project"), project_id)
            .await
            .context("Failed to write namespace marker")?;
        Ok(())
    }

    async fn is_ready(&self, namespace: &str) -> Result<bool> {
        self.exists(namespace).await
    }

    fn workdir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }
}

/// Owns namespace existence/creation per project.
pub struct NamespaceManager {
    backend: Arc<dyn NamespaceBackend>,
    locks: ProjectLocks,
    ready_timeout: Duration,
}

impl NamespaceManager {
    pub fn new(backend: Arc<dyn NamespaceBackend>, locks: ProjectLocks, ready_timeout: Duration) -> Self {
        Self {
            backend,
            locks,
            ready_timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn NamespaceBackend> {
        &self.backend
    }

    /// Provision the namespace for `request.project_id`.
    ///
    /// The caller must already have admitted the request (project marked
    /// `provisioning`). Emits `start`, the three steps and a terminal update,
    /// moves the project to `ready`/`failed`, then sends `namespace_complete`
    /// or an outer `error`.
    pub async fn ensure(
        &self,
        request: &NamespaceSetup,
        state: &SessionState,
        bus: &mut UpdateBus,
    ) -> Result<String, NamespaceError> {
        let started = Instant::now();
        let namespace = namespace_id(&request.project_id);

        self.start(request, bus).await;

        let lock = self.locks.get(&request.project_id, OperationKind::Namespace).await;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                bus.log_line("info", "Waiting for another provisioning run of this project")
                    .await;
                lock.lock().await
            }
        };

        match self.provision(&namespace, &request.project_id, bus).await {
            Ok(()) => {
                state.finish_namespace(&request.project_id, &namespace, true, bus.log().clone());
                tracing::info!(
                    project = %request.project_id,
                    namespace = %namespace,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Namespace ready"
                );
                bus.complete("Namespace setup completed", started.elapsed().as_millis())
                    .await;
                bus.finish(
                    Status::Success,
                    json!({ "message": "Namespace setup completed", "namespace": namespace }),
                )
                .await;
                Ok(namespace)
            }
            Err((step, err)) => {
                tracing::warn!(
                    project = %request.project_id,
                    namespace = %namespace,
                    step,
                    error = %err,
                    "Namespace provisioning failed"
                );
                let message = err.to_string();
                bus.error(err.code(), &message, Some(step)).await;
                state.finish_namespace(&request.project_id, &namespace, false, bus.log().clone());
                bus.send(Envelope::error(err.code(), message)).await;
                Err(err)
            }
        }
    }

    async fn start(&self, request: &NamespaceSetup, bus: &mut UpdateBus) {
        bus.start(json!({
            "namespace": namespace_id(&request.project_id),
            "projectType": request.project_type.as_str(),
            "backend": self.backend.name(),
        }))
        .await;
    }

    /// Close out a provisioning run whose task was cancelled. A run cancelled
    /// before it emitted anything still reports `start` then `error`.
    pub async fn abandon(&self, request: &NamespaceSetup, state: &SessionState, bus: &mut UpdateBus) {
        let err = NamespaceError::Cancelled;
        if !bus.has_started() {
            self.start(request, bus).await;
        }
        if !bus.is_terminated() {
            bus.error(err.code(), &err.to_string(), None).await;
        }
        let namespace = namespace_id(&request.project_id);
        state.finish_namespace(&request.project_id, &namespace, false, bus.log().clone());
        bus.send(Envelope::error(err.code(), err.to_string())).await;
    }

    async fn provision(
        &self,
        namespace: &str,
        project_id: &str,
        bus: &mut UpdateBus,
    ) -> Result<(), (&'static str, NamespaceError)> {
        bus.step(STEP_CHECK, "Checking whether the namespace exists").await;
        let exists = self.backend.exists(namespace).await.map_err(|e| {
            (
                STEP_CHECK,
                NamespaceError::CheckFailed {
                    namespace: namespace.to_string(),
                    source: e.into(),
                },
            )
        })?;

        if exists {
            bus.step_skipped(STEP_CREATE, "Namespace already exists").await;
        } else {
            bus.step(STEP_CREATE, "Creating namespace").await;
            self.backend
                .create(namespace, project_id)
                .await
                .map_err(|e| {
                    (
                        STEP_CREATE,
                        NamespaceError::CreateFailed {
                            namespace: namespace.to_string(),
                            source: e.into(),
                        },
                    )
                })?;
        }

        bus.step(STEP_WAIT_READY, "Waiting for the namespace to become ready")
            .await;
        self.wait_ready(namespace)
            .await
            .map_err(|e| (STEP_WAIT_READY, e))
    }

    async fn wait_ready(&self, namespace: &str) -> Result<(), NamespaceError> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            let ready = self
                .backend
                .is_ready(namespace)
                .await
                .map_err(|e| NamespaceError::CheckFailed {
                    namespace: namespace.to_string(),
                    source: e.into(),
                })?;
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
                return Err(NamespaceError::NotReady {
                    namespace: namespace.to_string(),
                    timeout: self.ready_timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}
