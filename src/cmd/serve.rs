//! Session server command: `shipyard serve`.

use std::path::Path;

use anyhow::{Context, Result};

use shipyard::config::{NamespaceBackendKind, ShipyardToml};
use shipyard::observability::init_logging;
use shipyard::session::server::{ServerConfig, start_server};

/// Flags given on the command line; they win over file and environment.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dev: bool,
    pub namespace_backend: Option<NamespaceBackendKind>,
}

impl ServeOverrides {
    fn apply(self, settings: &mut ShipyardToml) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.dev {
            settings.server.dev_mode = true;
        }
        if let Some(backend) = self.namespace_backend {
            settings.namespace.backend = backend;
        }
    }
}

pub async fn cmd_serve(config_path: &Path, overrides: ServeOverrides, verbose: bool) -> Result<()> {
    let mut settings = ShipyardToml::load_or_default(config_path)?;
    settings
        .apply_env()
        .context("Invalid SHIPYARD_* environment override")?;
    overrides.apply(&mut settings);

    let _log_guard = init_logging(&settings.logging, verbose)?;
    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }
    tracing::debug!(config = %config_path.display(), "Configuration loaded");

    start_server(ServerConfig::from_toml(settings)).await
}
