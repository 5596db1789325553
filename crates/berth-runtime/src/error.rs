//! Typed error hierarchy for the workspace runtime.
//!
//! - `EngineError`: raw container-engine failures, classified structurally
//! - `ProvisioningError`: lifecycle failures surfaced to callers
//! - `ProxyUnavailable`: why a workspace cannot be proxied right now
//! - `RuntimeError`: everything a runtime operation can return

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`ContainerEngine`](crate::engine::ContainerEngine).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container engine unreachable: {0}")]
    Unreachable(String),

    #[error("Container engine error ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Critical-path lifecycle failures.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Container engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Failed to pull image {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("Container {container} has no host port bound for {internal_port}/tcp")]
    PortBinding {
        container: String,
        internal_port: u16,
    },

    #[error("Container engine rejected {operation}: {source}")]
    Engine {
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Failed to prepare workspace directory {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisioningError {
    pub fn engine(operation: &'static str, source: EngineError) -> Self {
        match source {
            EngineError::Unreachable(msg) => ProvisioningError::EngineUnreachable(msg),
            source => ProvisioningError::Engine { operation, source },
        }
    }
}

/// Why an existing container is torn down and created again. Internal: the
/// recreation is logged, never returned as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateReason {
    MountMismatch,
    ImageMismatch,
}

impl std::fmt::Display for RecreateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecreateReason::MountMismatch => write!(f, "mount type does not match hosting type"),
            RecreateReason::ImageMismatch => write!(f, "image does not match configured image"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyUnavailable {
    #[error("Workspace {0} is unknown")]
    UnknownWorkspace(String),

    #[error("Workspace {0} is not running")]
    NotRunning(String),

    #[error("Workspace {0} has no bound port")]
    NoPort(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Workspace {0} not found")]
    WorkspaceNotFound(String),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("No agent connected for user {user_id}")]
    AgentUnavailable { user_id: String },

    #[error("Agent did not answer {command} within {after:?}")]
    CommandTimeout { command: String, after: Duration },

    #[error("Agent command {command} failed: {message}")]
    AgentCommandFailed { command: String, message: String },

    #[error("Agent connection for user {user_id} closed before replying")]
    AgentDisconnected { user_id: String },

    #[error(transparent)]
    ProxyUnavailable(#[from] ProxyUnavailable),

    #[error("No terminal available for workspace {workspace_id}: {reason}")]
    TerminalUnavailable {
        workspace_id: String,
        reason: String,
    },

    #[error("Container for workspace {0} is not running")]
    ContainerNotRunning(String),

    #[error("`{command}` exited with {exit_code}: {stderr}")]
    ExecFailed {
        command: String,
        exit_code: i64,
        stderr: String,
    },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub(crate) fn engine(operation: &'static str, source: EngineError) -> Self {
        RuntimeError::Provisioning(ProvisioningError::engine(operation, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_classifies_unreachable_engine() {
        let err = ProvisioningError::engine(
            "inspect_container",
            EngineError::Unreachable("socket missing".into()),
        );
        assert!(matches!(err, ProvisioningError::EngineUnreachable(ref m) if m == "socket missing"));
    }

    #[test]
    fn provisioning_error_keeps_operation_for_api_errors() {
        let err = ProvisioningError::engine(
            "start_container",
            EngineError::Api {
                status: 500,
                message: "boom".into(),
            },
        );
        match &err {
            ProvisioningError::Engine { operation, source } => {
                assert_eq!(*operation, "start_container");
                assert!(matches!(source, EngineError::Api { status: 500, .. }));
            }
            _ => panic!("Expected Engine variant"),
        }
        assert!(err.to_string().contains("start_container"));
    }

    #[test]
    fn runtime_error_converts_from_proxy_unavailable() {
        let err: RuntimeError = ProxyUnavailable::NotRunning("w1".into()).into();
        assert!(matches!(
            err,
            RuntimeError::ProxyUnavailable(ProxyUnavailable::NotRunning(_))
        ));
        assert!(err.to_string().contains("w1"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EngineError::NotFound("x".into()));
        assert_std_error(&ProvisioningError::EngineUnreachable("x".into()));
        assert_std_error(&RuntimeError::InvalidPath("x".into()));
    }
}
