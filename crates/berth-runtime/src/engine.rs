//! Container engine abstraction.
//!
//! The lifecycle manager, terminal multiplexer and proxy router only ever talk
//! to a [`ContainerEngine`]. Production uses [`DockerEngine`](crate::docker::DockerEngine);
//! tests drive the same code with an in-memory fake.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWrite;

use crate::error::EngineError;

/// How the project directory is attached to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// Host directory, already translated for the engine host.
    Bind { source: String, target: String },
    Volume { name: String, target: String },
}

impl MountSpec {
    pub fn kind(&self) -> MountKind {
        match self {
            MountSpec::Bind { .. } => MountKind::Bind,
            MountSpec::Volume { .. } => MountKind::Volume,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            MountSpec::Bind { target, .. } | MountSpec::Volume { target, .. } => target,
        }
    }

    /// `source:target` form understood by the engine's bind list.
    pub fn to_bind(&self) -> String {
        match self {
            MountSpec::Bind { source, target } => format!("{source}:{target}"),
            MountSpec::Volume { name, target } => format!("{name}:{target}"),
        }
    }
}

/// Everything needed to create a workspace container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mount: MountSpec,
    /// Container port published on a dynamic host port.
    pub internal_port: u16,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Observed state of a container, as returned by inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub mounts: Vec<ObservedMount>,
    /// Published ports, container port to host port.
    pub ports: HashMap<u16, u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMount {
    pub kind: MountKind,
    pub destination: String,
}

impl ContainerInfo {
    /// Kind of the mount at `target`, if anything is mounted there.
    pub fn mount_at(&self, target: &str) -> Option<MountKind> {
        let target = target.trim_end_matches('/');
        self.mounts
            .iter()
            .find(|m| m.destination.trim_end_matches('/') == target)
            .map(|m| m.kind)
    }

    pub fn host_port(&self, internal_port: u16) -> Option<u16> {
        self.ports.get(&internal_port).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Attached TTY exec: output chunks in order, and a writable stdin.
pub struct ShellStream {
    pub output: BoxStream<'static, Result<Bytes, EngineError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ShellStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// `Ok(None)` when no container with that name exists.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError>;

    /// Returns the new container's id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, name: &str) -> Result<(), EngineError>;

    async fn restart_container(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError>;

    /// Idempotent: an existing volume with the same name is success.
    async fn create_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'p> Fn(&'p str) + Send + Sync),
    ) -> Result<(), EngineError>;

    /// Run a command to completion and capture its output.
    async fn exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, EngineError>;

    /// Attach an interactive TTY running `shell`.
    async fn exec_interactive(&self, name: &str, shell: &str) -> Result<ShellStream, EngineError>;

    async fn ping(&self) -> Result<(), EngineError>;
}

/// Compare image references, treating an untagged reference as `:latest`.
pub fn image_matches(observed: &str, desired: &str) -> bool {
    normalize_image(observed) == normalize_image(desired)
}

fn normalize_image(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || image.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}
