//! Typed error hierarchy for Shipyard.
//!
//! Three enums cover the three places failures are detected:
//! - `ProtocolError`: malformed or unknown inbound frames (message codec)
//! - `NamespaceError`: namespace backend failures (namespace manager)
//! - `ExecutionError`: clone/install/command failures (operation executor)
//!
//! Each exposes a stable `code()` that is sent to clients verbatim.

use std::time::Duration;

use thiserror::Error;

/// Boxed source error carried by backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{0}")]
    InvalidFormat(String),

    #[error("Unknown message type '{0}'")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_message_format",
            Self::UnknownType(_) => "unknown_message_type",
        }
    }
}

/// Errors from the namespace backend.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("Failed to check namespace {namespace}: {source}")]
    CheckFailed {
        namespace: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to create namespace {namespace}: {source}")]
    CreateFailed {
        namespace: String,
        #[source]
        source: BoxError,
    },

    #[error("Namespace {namespace} not ready after {}s", .timeout.as_secs())]
    NotReady { namespace: String, timeout: Duration },

    #[error("Namespace setup cancelled")]
    Cancelled,
}

impl NamespaceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CheckFailed { .. } => "namespace_check_failed",
            Self::CreateFailed { .. } => "namespace_create_failed",
            Self::NotReady { .. } => "namespace_not_ready",
            Self::Cancelled => "operation_cancelled",
        }
    }
}

/// Errors from a single test or deploy step.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to clone {repo_url}: {source}")]
    CloneFailed {
        repo_url: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to check out commit {commit}: {source}")]
    CheckoutFailed {
        commit: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code}")]
    NonZeroExit { command: String, exit_code: i32 },

    #[error("'{command}' timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("Service exited during startup with code {exit_code}")]
    LaunchExited { exit_code: i32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Wire code for this error. `step` refines codes that depend on where the
    /// failure happened (a non-zero exit while running tests is `tests_failed`).
    pub fn code(&self, step: &str) -> &'static str {
        match self {
            Self::CloneFailed { .. } => "clone_failed",
            Self::CheckoutFailed { .. } => "checkout_failed",
            Self::Timeout { .. } => "command_timeout",
            Self::LaunchExited { .. } => "launch_failed",
            Self::Cancelled => "operation_cancelled",
            Self::SpawnFailed { .. } | Self::NonZeroExit { .. } | Self::Other(_) => match step {
                "install_dependencies" => "install_failed",
                "run_tests" => "tests_failed",
                "launch_service" => "launch_failed",
                _ => "command_failed",
            },
        }
    }

    /// Exit code of the failing command, when there was one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { exit_code, .. } | Self::LaunchExited { exit_code } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}
