use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::LogOutput,
    errors::Error as BollardError,
    exec::StartExecResults,
    models::{
        ContainerCreateBody, ContainerInspectResponse, ExecConfig, HostConfig,
        MountPointTypeEnum, PortBinding, PortMap, VolumeCreateOptions,
    },
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RemoveContainerOptionsBuilder, RemoveVolumeOptions, RestartContainerOptionsBuilder,
        StartContainerOptions, StopContainerOptionsBuilder,
    },
};
use futures_util::StreamExt;
use tracing::debug;

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, MountKind, ObservedMount,
    ShellStream,
};
use crate::error::EngineError;

const DOCKER_TIMEOUT_SECS: u64 = 120;
const STOP_GRACE_SECS: i32 = 10;

/// [`ContainerEngine`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform default socket. A
    /// `unix://` endpoint may be given explicitly.
    pub fn connect(endpoint: Option<&str>) -> Result<Self, EngineError> {
        let docker = match endpoint {
            Some(endpoint) => {
                let path = endpoint.strip_prefix("unix://").unwrap_or(endpoint);
                Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(info_from_inspect(name, response))),
            Err(err) => match engine_error(err) {
                EngineError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let port_key = format!("{}/tcp", spec.internal_port);
        let port_bindings: PortMap = HashMap::from([(
            port_key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(String::new()),
            }]),
        )]);

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            working_dir: Some(spec.mount.target().to_string()),
            host_config: Some(HostConfig {
                binds: Some(vec![spec.mount.to_bind()]),
                port_bindings: Some(port_bindings),
                memory: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|err| match engine_error(err) {
                // The only missing object a create can report is the image.
                EngineError::NotFound(msg) => EngineError::ImageNotFound(msg),
                other => other,
            })?;
        Ok(created.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => not_modified_is_ok(engine_error(err)),
        }
    }

    async fn stop_container(&self, name: &str) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => not_modified_is_ok(engine_error(err)),
        }
    }

    async fn restart_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .restart_container(
                name,
                Some(RestartContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
            .map_err(engine_error)
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptionsBuilder::new().force(force).build()),
            )
            .await
            .map_err(engine_error)
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(engine_error)
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(engine_error)
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'p> Fn(&'p str) + Send + Sync),
    ) -> Result<(), EngineError> {
        let (from_image, tag) = split_image(image);
        let mut stream = self.docker.create_image(
            Some(
                CreateImageOptionsBuilder::new()
                    .from_image(from_image)
                    .tag(tag)
                    .build(),
            ),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            let info = item.map_err(engine_error)?;
            if let Some(status) = info.status {
                match info.progress {
                    Some(bar) => progress(&format!("{status} {bar}")),
                    None => progress(&status),
                }
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput, EngineError> {
        let created = self
            .docker
            .create_exec(
                name,
                ExecConfig {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd),
                    env: (!env.is_empty()).then_some(env),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(engine_error)?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(engine_error)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.extend_from_slice(&message)
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&created.id)
            .await
            .map_err(engine_error)?;
        let exit_code = inspected.exit_code.unwrap_or(-1);
        debug!(container = name, exit_code, "exec finished");

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn exec_interactive(&self, name: &str, shell: &str) -> Result<ShellStream, EngineError> {
        let created = self
            .docker
            .create_exec(
                name,
                ExecConfig {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(vec![shell.to_string()]),
                    env: Some(vec!["TERM=xterm-256color".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_error)?;

        match self
            .docker
            .start_exec(&created.id, None)
            .await
            .map_err(engine_error)?
        {
            StartExecResults::Attached { output, input } => Ok(ShellStream {
                output: output
                    .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(engine_error))
                    .boxed(),
                input,
            }),
            StartExecResults::Detached => Err(EngineError::Api {
                status: 500,
                message: format!("exec of {shell} in {name} started detached"),
            }),
        }
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await.map(|_| ()).map_err(engine_error)
    }
}

/// Classify by HTTP status only; transport-level failures mean the daemon
/// is unreachable.
fn engine_error(err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound(message),
            409 => EngineError::Conflict(message),
            status => EngineError::Api { status, message },
        },
        other => EngineError::Unreachable(other.to_string()),
    }
}

fn not_modified_is_ok(err: EngineError) -> Result<(), EngineError> {
    match err {
        EngineError::Api { status: 304, .. } => Ok(()),
        other => Err(other),
    }
}

fn info_from_inspect(name: &str, response: ContainerInspectResponse) -> ContainerInfo {
    let running = response
        .state
        .as_ref()
        .and_then(|s| s.running)
        .unwrap_or(false);
    let image = response
        .config
        .as_ref()
        .and_then(|c| c.image.clone())
        .unwrap_or_default();

    let mounts = response
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| {
            let kind = match m.typ? {
                MountPointTypeEnum::BIND => MountKind::Bind,
                MountPointTypeEnum::VOLUME => MountKind::Volume,
                _ => return None,
            };
            Some(ObservedMount {
                kind,
                destination: m.destination.unwrap_or_default(),
            })
        })
        .collect();

    let ports = response
        .network_settings
        .and_then(|n| n.ports)
        .map(|map| published_ports(&map))
        .unwrap_or_default();

    ContainerInfo {
        id: response.id.unwrap_or_default(),
        name: response
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| name.to_string()),
        image,
        running,
        mounts,
        ports,
    }
}

/// `"8080/tcp" -> [{HostPort: "49153"}]` becomes `8080 -> 49153`.
fn published_ports(map: &PortMap) -> HashMap<u16, u16> {
    map.iter()
        .filter_map(|(key, bindings)| {
            let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            if proto != "tcp" {
                return None;
            }
            let internal = port.parse::<u16>().ok()?;
            let host = bindings
                .as_ref()?
                .iter()
                .find_map(|b| b.host_port.as_deref()?.parse::<u16>().ok())?;
            Some((internal, host))
        })
        .collect()
}

/// Split `repo[:tag]`, leaving a registry port alone.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, ContainerState, MountPoint, NetworkSettings};

    #[test]
    fn test_engine_error_classifies_by_status() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: berth-ws-w1".into(),
        };
        assert!(matches!(engine_error(not_found), EngineError::NotFound(_)));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name already in use".into(),
        };
        assert!(matches!(engine_error(conflict), EngineError::Conflict(_)));

        let server = BollardError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(
            engine_error(server),
            EngineError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_not_modified_is_success() {
        assert!(
            not_modified_is_ok(EngineError::Api {
                status: 304,
                message: String::new()
            })
            .is_ok()
        );
        assert!(not_modified_is_ok(EngineError::Conflict("x".into())).is_err());
    }

    #[test]
    fn test_split_image() {
        assert_eq!(
            split_image("codercom/code-server:4.9"),
            ("codercom/code-server", "4.9")
        );
        assert_eq!(split_image("ubuntu"), ("ubuntu", "latest"));
        assert_eq!(
            split_image("registry.local:5000/ide"),
            ("registry.local:5000/ide", "latest")
        );
    }

    #[test]
    fn test_info_from_inspect() {
        let response = ContainerInspectResponse {
            id: Some("abc123".into()),
            name: Some("/berth-ws-w1".into()),
            state: Some(ContainerState {
                running: Some(true),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: Some("codercom/code-server:latest".into()),
                ..Default::default()
            }),
            mounts: Some(vec![MountPoint {
                typ: Some(MountPointTypeEnum::VOLUME),
                destination: Some("/home/coder/project".into()),
                ..Default::default()
            }]),
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([
                    (
                        "8080/tcp".to_string(),
                        Some(vec![PortBinding {
                            host_ip: Some("0.0.0.0".into()),
                            host_port: Some("49153".into()),
                        }]),
                    ),
                    ("9000/udp".to_string(), None),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = info_from_inspect("berth-ws-w1", response);
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "berth-ws-w1");
        assert!(info.running);
        assert_eq!(info.mount_at("/home/coder/project"), Some(MountKind::Volume));
        assert_eq!(info.host_port(8080), Some(49153));
        assert_eq!(info.ports.len(), 1);
    }
}
