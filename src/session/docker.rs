//! Docker-backed namespaces: one labelled bridge network per project.
//!
//! Sources for operations still live on the host under `workspace_root`, so
//! the sandbox works identically for both backends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::NetworkCreateRequest;
use bollard::query_parameters::InspectNetworkOptions;

use super::namespace::NamespaceBackend;

/// Label marking networks this service owns.
pub const MANAGED_LABEL: &str = "dev.shipyard.managed";
/// Label carrying the originating project id.
pub const PROJECT_LABEL: &str = "dev.shipyard.project";

pub struct DockerNamespaces {
    docker: Docker,
    workspace_root: PathBuf,
}

impl DockerNamespaces {
    /// Connect to the local Docker daemon and verify it answers.
    pub async fn connect(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        docker.ping().await.context("Docker daemon did not answer ping")?;
        Ok(Self {
            docker,
            workspace_root: workspace_root.as_ref().to_path_buf(),
        })
    }

    async fn inspect(&self, namespace: &str) -> Result<bool> {
        match self
            .docker
            .inspect_network(namespace, None::<InspectNetworkOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect network {}", namespace)),
        }
    }
}

/// Request body for a namespace network.
pub fn network_request(namespace: &str, project_id: &str) -> NetworkCreateRequest {
    NetworkCreateRequest {
        name: namespace.to_string(),
        driver: Some("bridge".to_string()),
        labels: Some(HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (PROJECT_LABEL.to_string(), project_id.to_string()),
        ])),
        ..Default::default()
    }
}

#[async_trait]
impl NamespaceBackend for DockerNamespaces {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn exists(&self, namespace: &str) -> Result<bool> {
        self.inspect(namespace).await
    }

    async fn create(&self, namespace: &str, project_id: &str) -> Result<()> {
        self.docker
            .create_network(network_request(namespace, project_id))
            .await
            .with_context(|| format!("Failed to create network {}", namespace))?;
        tokio::fs::create_dir_all(self.workdir(namespace))
            .await
            .context("Failed to create namespace workspace")?;
        Ok(())
    }

    async fn is_ready(&self, namespace: &str) -> Result<bool> {
        Ok(self.inspect(namespace).await? && tokio::fs::try_exists(self.workdir(namespace)).await?)
    }

    fn workdir(&self, namespace: &str) -> PathBuf {
        self.workspace_root.join(namespace)
    }
}
