//! Unified configuration for Shipyard, read from `shipyard.toml`.
//!
//! Values are layered file → environment → CLI. A missing file means
//! defaults everywhere.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3142
//! dev_mode = false
//!
//! [namespace]
//! backend = "local"            # or "docker"
//! workspace_root = ".shipyard/namespaces"
//! ready_timeout_secs = 60
//!
//! [execution]
//! command_timeout_secs = 600
//! event_log_capacity = 256
//!
//! [deploy]
//! domain_suffix = "shipyard.localhost"
//! service_port = 8000
//! launch_grace_secs = 2
//!
//! [logging]
//! format = "pretty"            # or "json"
//! directory = ".shipyard/logs" # optional rolling file output
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, resolved against the working directory.
pub const CONFIG_FILE_NAME: &str = "shipyard.toml";

/// Which namespace backend provisions project namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceBackendKind {
    /// Directory per namespace under `workspace_root`
    #[default]
    Local,
    /// Labelled Docker network per namespace
    Docker,
}

impl std::fmt::Display for NamespaceBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceBackendKind::Local => write!(f, "local"),
            NamespaceBackendKind::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for NamespaceBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(NamespaceBackendKind::Local),
            "docker" => Ok(NamespaceBackendKind::Docker),
            _ => anyhow::bail!(
                "Invalid namespace backend '{}'. Valid values: local, docker",
                s
            ),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS for browser clients served from another origin
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3142
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceSection {
    #[serde(default)]
    pub backend: NamespaceBackendKind,
    /// Root directory holding one sub-directory per namespace
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    /// How long `wait_ready` may take before provisioning fails
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".shipyard").join("namespaces")
}

fn default_ready_timeout_secs() -> u64 {
    60
}

impl Default for NamespaceSection {
    fn default() -> Self {
        Self {
            backend: NamespaceBackendKind::default(),
            workspace_root: default_workspace_root(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Upper bound for any single command run by an operation
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Number of update types retained per operation record
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_event_log_capacity() -> usize {
    256
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySection {
    /// Domain under which `im-<project>` hosts are published
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,
    /// First `$PORT` handed out; each project gets its own port from here up
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// A service that exits within this window counts as a failed launch
    #[serde(default = "default_launch_grace_secs")]
    pub launch_grace_secs: u64,
}

fn default_domain_suffix() -> String {
    "shipyard.localhost".to_string()
}

fn default_service_port() -> u16 {
    8000
}

fn default_launch_grace_secs() -> u64 {
    2
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            domain_suffix: default_domain_suffix(),
            service_port: default_service_port(),
            launch_grace_secs: default_launch_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files; stdout only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

/// The complete shipyard.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShipyardToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub namespace: NamespaceSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub deploy: DeploySection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ShipyardToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipyard.toml")
    }

    /// Load from `path`, returning defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize shipyard.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `SHIPYARD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `SHIPYARD_*` overrides using `lookup` as the environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SHIPYARD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("SHIPYARD_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid SHIPYARD_PORT '{}'", port))?;
        }
        if let Some(root) = lookup("SHIPYARD_WORKSPACE") {
            self.namespace.workspace_root = PathBuf::from(root);
        }
        if let Some(suffix) = lookup("SHIPYARD_DOMAIN_SUFFIX") {
            self.deploy.domain_suffix = suffix;
        }
        if let Some(backend) = lookup("SHIPYARD_NAMESPACE_BACKEND") {
            self.namespace.backend = backend.parse()?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.execution.command_timeout_secs == 0 {
            warnings.push("execution.command_timeout_secs is 0: every command will time out".into());
        }
        if self.execution.event_log_capacity == 0 {
            warnings.push("execution.event_log_capacity is 0: no operation history is kept".into());
        }
        if self.namespace.ready_timeout_secs == 0 {
            warnings.push("namespace.ready_timeout_secs is 0: readiness waits fail immediately".into());
        }

        let suffix = &self.deploy.domain_suffix;
        if suffix.is_empty()
            || suffix.starts_with('.')
            || suffix.ends_with('.')
            || !suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            warnings.push(format!(
                "Invalid deploy.domain_suffix '{}': should be a DNS name like 'apps.example.com'",
                suffix
            ));
        }

        warnings
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.command_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.namespace.ready_timeout_secs)
    }

    pub fn launch_grace(&self) -> Duration {
        Duration::from_secs(self.deploy.launch_grace_secs)
    }
}
