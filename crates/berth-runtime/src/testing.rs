//! In-memory test doubles for the container engine and health probe.
//!
//! Compiled for this crate's tests and for dependents that enable the
//! `test-util` feature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, DuplexStream};

use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, MountKind, ObservedMount,
    ShellStream, image_matches,
};
use crate::error::EngineError;
use crate::health::HealthProbe;

const FIRST_HOST_PORT: u16 = 49153;

#[derive(Debug, Clone)]
struct FakeContainer {
    info: ContainerInfo,
}

#[derive(Debug, Default)]
struct Counters {
    creates: u32,
    starts: u32,
    stops: u32,
    restarts: u32,
    removes: u32,
    pulls: u32,
    shells: u32,
    inspects: u32,
}

#[derive(Debug)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    volumes: HashSet<String>,
    missing_images: HashSet<String>,
    missing_binaries: HashSet<String>,
    exec_stdout: HashMap<String, String>,
    exec_stderr: HashMap<String, String>,
    exec_exit_codes: HashMap<String, i64>,
    exec_log: Vec<Vec<String>>,
    hidden: HashMap<String, u32>,
    volumes_in_use: HashSet<String>,
    shells: VecDeque<FakeShell>,
    next_port: u16,
    fixed_port: Option<u16>,
    next_id: u64,
    counters: Counters,
}

/// Engine-side ends of an interactive exec created by [`FakeEngine`].
///
/// Read `stdin` to see what the client typed; write to `stdout` to produce
/// terminal output; drop `stdout` to end the session.
#[derive(Debug)]
pub struct FakeShell {
    pub container: String,
    pub shell: String,
    pub stdin: DuplexStream,
    pub stdout: DuplexStream,
}

/// Scriptable in-memory [`ContainerEngine`].
#[derive(Debug)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
    unreachable: AtomicBool,
    pull_fails: AtomicBool,
    publish_ports: AtomicBool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                containers: HashMap::new(),
                volumes: HashSet::new(),
                missing_images: HashSet::new(),
                missing_binaries: HashSet::new(),
                exec_stdout: HashMap::new(),
                exec_stderr: HashMap::new(),
                exec_exit_codes: HashMap::new(),
                exec_log: Vec::new(),
                hidden: HashMap::new(),
                volumes_in_use: HashSet::new(),
                shells: VecDeque::new(),
                next_port: FIRST_HOST_PORT,
                fixed_port: None,
                next_id: 1,
                counters: Counters::default(),
            }),
            unreachable: AtomicBool::new(false),
            pull_fails: AtomicBool::new(false),
            publish_ports: AtomicBool::new(true),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self) -> Result<(), EngineError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(EngineError::Unreachable("connection refused".into()))
        } else {
            Ok(())
        }
    }

    // ── Scripting ──

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_pull_fails(&self, fails: bool) {
        self.pull_fails.store(fails, Ordering::SeqCst);
    }

    /// When false, created containers get no published port.
    pub fn set_publish_ports(&self, publish: bool) {
        self.publish_ports.store(publish, Ordering::SeqCst);
    }

    pub fn set_missing_image(&self, image: &str) {
        self.state().missing_images.insert(image.to_string());
    }

    /// Every created container publishes this host port.
    pub fn set_host_port(&self, port: u16) {
        self.state().fixed_port = Some(port);
    }

    /// Commands whose first word is `binary` exit with 127.
    pub fn set_missing_binary(&self, binary: &str) {
        self.state().missing_binaries.insert(binary.to_string());
    }

    /// Stdout returned by commands whose first word is `binary`.
    pub fn set_exec_stdout(&self, binary: &str, stdout: &str) {
        self.state()
            .exec_stdout
            .insert(binary.to_string(), stdout.to_string());
    }

    pub fn set_exec_stderr(&self, binary: &str, stderr: &str) {
        self.state()
            .exec_stderr
            .insert(binary.to_string(), stderr.to_string());
    }

    pub fn set_exec_exit_code(&self, binary: &str, code: i64) {
        self.state()
            .exec_exit_codes
            .insert(binary.to_string(), code);
    }

    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(c) = self.state().containers.get_mut(name) {
            c.info.running = running;
        }
    }

    /// The next `times` inspections of `name` report no container, as if
    /// another process created it in between.
    pub fn hide_container(&self, name: &str, times: u32) {
        self.state().hidden.insert(name.to_string(), times);
    }

    /// Removing `volume` fails with a conflict, as if a container used it.
    pub fn set_volume_in_use(&self, volume: &str) {
        self.state().volumes_in_use.insert(volume.to_string());
    }

    /// Insert a container as if created earlier. Returns its id.
    pub fn seed_container(&self, name: &str, image: &str, mount: MountKind, running: bool) -> String {
        let mut state = self.state();
        let id = format!("seed{}", state.next_id);
        state.next_id += 1;
        let port = allocate_port(&mut state);
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    image: image.to_string(),
                    running,
                    mounts: vec![ObservedMount {
                        kind: mount,
                        destination: "/home/coder/project".to_string(),
                    }],
                    ports: HashMap::from([(8080, port)]),
                },
            },
        );
        id
    }

    // ── Observation ──

    pub fn container(&self, name: &str) -> Option<ContainerInfo> {
        self.state().containers.get(name).map(|c| c.info.clone())
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state().volumes.contains(name)
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.state().exec_log.clone()
    }

    /// Oldest interactive exec not yet taken.
    pub fn take_shell(&self) -> Option<FakeShell> {
        self.state().shells.pop_front()
    }

    pub fn creates(&self) -> u32 {
        self.state().counters.creates
    }

    pub fn starts(&self) -> u32 {
        self.state().counters.starts
    }

    pub fn stops(&self) -> u32 {
        self.state().counters.stops
    }

    pub fn restarts(&self) -> u32 {
        self.state().counters.restarts
    }

    pub fn removes(&self) -> u32 {
        self.state().counters.removes
    }

    pub fn pulls(&self) -> u32 {
        self.state().counters.pulls
    }

    pub fn inspects(&self) -> u32 {
        self.state().counters.inspects
    }

    pub fn shells_opened(&self) -> u32 {
        self.state().counters.shells
    }
}

fn allocate_port(state: &mut FakeState) -> u16 {
    if let Some(port) = state.fixed_port {
        return port;
    }
    let port = state.next_port;
    state.next_port += 1;
    port
}

fn no_such_container(name: &str) -> EngineError {
    EngineError::NotFound(format!("No such container: {name}"))
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        state.counters.inspects += 1;
        if let Some(left) = state.hidden.get_mut(name)
            && *left > 0
        {
            *left -= 1;
            return Ok(None);
        }
        Ok(state.containers.get(name).map(|c| c.info.clone()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.check_reachable()?;
        tokio::task::yield_now().await;
        let publish = self.publish_ports.load(Ordering::SeqCst);
        let mut state = self.state();
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::Conflict(format!(
                "container name {} is already in use",
                spec.name
            )));
        }
        if state
            .missing_images
            .iter()
            .any(|img| image_matches(img, &spec.image))
        {
            return Err(EngineError::ImageNotFound(format!(
                "No such image: {}",
                spec.image
            )));
        }

        let id = format!("fake{}", state.next_id);
        state.next_id += 1;
        let ports = if publish {
            HashMap::from([(spec.internal_port, allocate_port(&mut state))])
        } else {
            HashMap::new()
        };
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    running: false,
                    mounts: vec![ObservedMount {
                        kind: spec.mount.kind(),
                        destination: spec.mount.target().to_string(),
                    }],
                    ports,
                },
            },
        );
        state.counters.creates += 1;
        Ok(id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.info.running = true;
        state.counters.starts += 1;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.info.running = false;
        state.counters.stops += 1;
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| no_such_container(name))?;
        container.info.running = true;
        state.counters.restarts += 1;
        Ok(())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        match state.containers.get(name) {
            None => return Err(no_such_container(name)),
            Some(c) if c.info.running && !force => {
                return Err(EngineError::Conflict(format!(
                    "container {name} is running"
                )));
            }
            Some(_) => {}
        }
        state.containers.remove(name);
        state.counters.removes += 1;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        self.state().volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        if state.volumes_in_use.contains(name) {
            return Err(EngineError::Conflict(format!("volume {name} is in use")));
        }
        if state.volumes.remove(name) {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("no such volume: {name}")))
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        progress: &(dyn for<'p> Fn(&'p str) + Send + Sync),
    ) -> Result<(), EngineError> {
        self.check_reachable()?;
        self.state().counters.pulls += 1;
        if self.pull_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: format!("manifest for {image} unknown"),
            });
        }
        progress("Pulling fs layer");
        progress("Download complete");
        self.state()
            .missing_images
            .retain(|img| !image_matches(img, image));
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        _env: Vec<String>,
    ) -> Result<ExecOutput, EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        match state.containers.get(name) {
            None => return Err(no_such_container(name)),
            Some(c) if !c.info.running => {
                return Err(EngineError::Conflict(format!(
                    "container {name} is not running"
                )));
            }
            Some(_) => {}
        }
        let binary = cmd.first().cloned().unwrap_or_default();
        state.exec_log.push(cmd);

        if state.missing_binaries.contains(&binary) {
            return Ok(ExecOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: format!("{binary}: not found"),
            });
        }
        Ok(ExecOutput {
            exit_code: state.exec_exit_codes.get(&binary).copied().unwrap_or(0),
            stdout: state.exec_stdout.get(&binary).cloned().unwrap_or_default(),
            stderr: state.exec_stderr.get(&binary).cloned().unwrap_or_default(),
        })
    }

    async fn exec_interactive(&self, name: &str, shell: &str) -> Result<ShellStream, EngineError> {
        self.check_reachable()?;
        let mut state = self.state();
        match state.containers.get(name) {
            None => return Err(no_such_container(name)),
            Some(c) if !c.info.running => {
                return Err(EngineError::Conflict(format!(
                    "container {name} is not running"
                )));
            }
            Some(_) => {}
        }

        let (client_stdin, engine_stdin) = tokio::io::duplex(8192);
        let (engine_stdout, client_stdout) = tokio::io::duplex(8192);
        state.shells.push_back(FakeShell {
            container: name.to_string(),
            shell: shell.to_string(),
            stdin: engine_stdin,
            stdout: engine_stdout,
        });
        state.counters.shells += 1;

        let output = futures_util::stream::unfold(Some(client_stdout), |reader| async move {
            let mut reader = reader?;
            let mut buf = vec![0u8; 4096];
            match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some(reader)))
                }
                Err(e) => Some((Err(EngineError::Unreachable(e.to_string())), None)),
            }
        })
        .boxed();

        Ok(ShellStream {
            output,
            input: Box::pin(client_stdin),
        })
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.check_reachable()
    }
}

/// [`HealthProbe`] that answers a fixed verdict and counts calls.
#[derive(Debug)]
pub struct CountingProbe {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl CountingProbe {
    pub fn healthy() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for CountingProbe {
    async fn probe(&self, _port: u16) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}
