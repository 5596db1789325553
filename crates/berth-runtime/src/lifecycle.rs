//! Container Lifecycle Manager.
//!
//! Owns the engine-side lifecycle of a workspace container: create, start,
//! bootstrap, health-check, restart, stop and remove. Decisions about an
//! existing container are made by the pure `plan_*` functions below; the
//! manager only executes the plan.
//!
//! Every mutating operation holds the workspace's single-flight lock, so
//! concurrent starts of one workspace collapse into one create.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth_common::{
    ContainerRecord, ContainerStatus, FsEntry, FsEntryKind, FsOperation, FsOutcome, HostingType,
    RecordStatus, StartedWorkspace, Workspace, WorkspaceStore, confine_path,
};
use tracing::{debug, info, instrument, warn};

use crate::engine::{ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, MountKind, MountSpec, image_matches};
use crate::error::{EngineError, ProvisioningError, RecreateReason, Result, RuntimeError};
use crate::health::{HealthPolicy, HealthProbe, wait_until_healthy};
use crate::paths::{EnginePathStyle, to_engine_path};
use crate::records::ContainerRecordStore;
use crate::repo::{authenticated_clone_url, redact, redact_credentials};
use crate::settings::{baseline_settings, install_command};
use crate::single_flight::KeyedMutex;

const DEFAULT_TREE_DEPTH: u32 = 3;
const MAX_TREE_DEPTH: u32 = 16;

pub fn container_name(workspace_id: &str) -> String {
    format!("berth-ws-{workspace_id}")
}

pub fn volume_name(workspace_id: &str) -> String {
    format!("berth-vol-{workspace_id}")
}

/// LOCAL workspaces bind a host directory; CLOUD workspaces use a named volume.
pub fn desired_mount_kind(hosting: HostingType) -> MountKind {
    match hosting {
        HostingType::Local => MountKind::Bind,
        HostingType::Cloud => MountKind::Volume,
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub image: String,
    pub internal_port: u16,
    pub storage_root: PathBuf,
    pub engine_path_style: EnginePathStyle,
    /// Project directory inside the container.
    pub mount_target: String,
    /// Editor settings file inside the container.
    pub settings_path: String,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    /// Pause between engine start and bootstrap steps.
    pub settle_delay: Duration,
    pub health: HealthPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            image: "codercom/code-server:latest".to_string(),
            internal_port: 8080,
            storage_root: PathBuf::from("./data"),
            engine_path_style: EnginePathStyle::Native,
            mount_target: "/home/coder/project".to_string(),
            settings_path: "/home/coder/.local/share/code-server/User/settings.json".to_string(),
            memory_bytes: None,
            nano_cpus: None,
            settle_delay: Duration::from_secs(2),
            health: HealthPolicy::default(),
        }
    }
}

// ── State machine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Offline,
    Provisioning,
    Running,
    Stopped,
    Removed,
}

impl LifecycleState {
    pub fn observe(info: Option<&ContainerInfo>) -> Self {
        match info {
            None => LifecycleState::Offline,
            Some(info) if info.running => LifecycleState::Running,
            Some(_) => LifecycleState::Stopped,
        }
    }

    pub fn status(self) -> ContainerStatus {
        match self {
            LifecycleState::Running => ContainerStatus::Running,
            LifecycleState::Provisioning | LifecycleState::Stopped => ContainerStatus::Stopped,
            LifecycleState::Offline | LifecycleState::Removed => ContainerStatus::Offline,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Offline => "offline",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Removed => "removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePlan {
    Create,
    Reuse,
    Recreate(RecreateReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPlan {
    Create,
    Recreate(RecreateReason),
    StartExisting,
    AlreadyRunning,
}

pub fn plan_create(observed: Option<&ContainerInfo>, image: &str) -> CreatePlan {
    match observed {
        None => CreatePlan::Create,
        Some(info) if !image_matches(&info.image, image) => {
            CreatePlan::Recreate(RecreateReason::ImageMismatch)
        }
        Some(_) => CreatePlan::Reuse,
    }
}

/// Guards apply in order: image, mount type, running.
pub fn plan_start(
    observed: Option<&ContainerInfo>,
    image: &str,
    mount_target: &str,
    mount: MountKind,
) -> StartPlan {
    let Some(info) = observed else {
        return StartPlan::Create;
    };
    if !image_matches(&info.image, image) {
        return StartPlan::Recreate(RecreateReason::ImageMismatch);
    }
    if info.mount_at(mount_target) != Some(mount) {
        return StartPlan::Recreate(RecreateReason::MountMismatch);
    }
    if info.running {
        StartPlan::AlreadyRunning
    } else {
        StartPlan::StartExisting
    }
}

/// Run a best-effort step: failures are logged and swallowed.
async fn advisory<F>(step: &'static str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    if let Err(e) = fut.await {
        warn!(step, error = %e, "advisory step failed; continuing");
    }
}

// ── Manager ───────────────────────────────────────────────────────────

pub struct ContainerLifecycleManager {
    engine: Arc<dyn ContainerEngine>,
    workspaces: Arc<dyn WorkspaceStore>,
    records: Arc<dyn ContainerRecordStore>,
    health: Arc<dyn HealthProbe>,
    config: LifecycleConfig,
    locks: KeyedMutex,
}

impl ContainerLifecycleManager {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        workspaces: Arc<dyn WorkspaceStore>,
        records: Arc<dyn ContainerRecordStore>,
        health: Arc<dyn HealthProbe>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            engine,
            workspaces,
            records,
            health,
            config,
            locks: KeyedMutex::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.workspaces
            .get_workspace(workspace_id)
            .await
            .ok_or_else(|| RuntimeError::WorkspaceNotFound(workspace_id.to_string()))
    }

    pub async fn create_container(&self, workspace_id: &str) -> Result<String> {
        let ws = self.workspace(workspace_id).await?;
        let _guard = self.locks.lock(&ws.id).await;
        self.create_locked(&ws).await
    }

    pub async fn start_container(&self, workspace_id: &str) -> Result<StartedWorkspace> {
        let ws = self.workspace(workspace_id).await?;
        self.start_workspace(&ws).await
    }

    pub async fn stop_container(&self, workspace_id: &str) -> Result<()> {
        let ws = self.workspace(workspace_id).await?;
        self.stop_workspace(&ws).await
    }

    pub async fn stop_and_remove_container(&self, workspace_id: &str) -> Result<()> {
        let ws = self.workspace(workspace_id).await?;
        self.remove_workspace(&ws).await
    }

    pub async fn restart_container(&self, workspace_id: &str) -> Result<StartedWorkspace> {
        let ws = self.workspace(workspace_id).await?;
        self.restart_workspace(&ws).await
    }

    pub async fn get_container_status(&self, workspace_id: &str) -> Result<ContainerStatus> {
        let ws = self.workspace(workspace_id).await?;
        self.status_workspace(&ws).await
    }

    /// Current record and superseded history.
    pub async fn records(&self, workspace_id: &str) -> (Option<ContainerRecord>, Vec<ContainerRecord>) {
        (
            self.records.current(workspace_id).await,
            self.records.history(workspace_id).await,
        )
    }

    /// Drop all bookkeeping for a deleted workspace.
    pub async fn purge_records(&self, workspace_id: &str) -> usize {
        let removed = self.records.purge(workspace_id).await;
        self.locks.release(workspace_id);
        info!(workspace_id, removed, "purged container records");
        removed
    }

    /// Forget per-workspace locks that are neither held nor awaited.
    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // ── Workspace-level operations ──

    #[instrument(skip_all, fields(workspace_id = %ws.id))]
    pub(crate) async fn start_workspace(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        let _guard = self.locks.lock(&ws.id).await;
        self.start_locked(ws).await
    }

    #[instrument(skip_all, fields(workspace_id = %ws.id))]
    pub(crate) async fn stop_workspace(&self, ws: &Workspace) -> Result<()> {
        let _guard = self.locks.lock(&ws.id).await;
        let name = container_name(&ws.id);
        match self.inspect(&name).await? {
            Some(info) if info.running => {
                self.engine
                    .stop_container(&name)
                    .await
                    .map_err(|e| RuntimeError::engine("stop_container", e))?;
                info!("container stopped");
            }
            _ => debug!("container not running; nothing to stop"),
        }
        self.records.set_status(&ws.id, RecordStatus::Stopped).await;
        Ok(())
    }

    #[instrument(skip_all, fields(workspace_id = %ws.id))]
    pub(crate) async fn remove_workspace(&self, ws: &Workspace) -> Result<()> {
        let _guard = self.locks.lock(&ws.id).await;
        let name = container_name(&ws.id);

        if let Some(info) = self.inspect(&name).await? {
            if info.running {
                match self.engine.stop_container(&name).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(RuntimeError::engine("stop_container", e)),
                }
            }
            self.force_remove(&name).await?;
            info!(state = %LifecycleState::Removed, "container removed");
        }

        if ws.hosting_type == HostingType::Cloud {
            let volume = volume_name(&ws.id);
            match self.engine.remove_volume(&volume).await {
                Ok(()) => info!(volume = %volume, "volume removed"),
                Err(EngineError::NotFound(_) | EngineError::Conflict(_)) => {
                    debug!(volume = %volume, "volume missing or in use; left in place")
                }
                Err(e) => warn!(volume = %volume, error = %e, "volume removal failed"),
            }
        }

        self.records.set_status(&ws.id, RecordStatus::Stopped).await;
        Ok(())
    }

    #[instrument(skip_all, fields(workspace_id = %ws.id))]
    pub(crate) async fn restart_workspace(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        let _guard = self.locks.lock(&ws.id).await;
        let name = container_name(&ws.id);

        if self.inspect(&name).await?.is_none() {
            info!("no container to restart; starting from scratch");
            return self.start_locked(ws).await;
        }

        self.engine
            .restart_container(&name)
            .await
            .map_err(|e| RuntimeError::engine("restart_container", e))?;
        advisory("install editor settings", self.install_settings(&name)).await;
        self.finish_running(ws, &name).await
    }

    pub(crate) async fn status_workspace(&self, ws: &Workspace) -> Result<ContainerStatus> {
        let observed = self.inspect(&container_name(&ws.id)).await?;
        Ok(LifecycleState::observe(observed.as_ref()).status())
    }

    /// Run a one-shot command in the project container. A non-zero exit is
    /// an error carrying the command's stderr.
    #[instrument(skip_all, fields(workspace_id = %ws.id))]
    pub(crate) async fn exec_workspace(&self, ws: &Workspace, command: &[String]) -> Result<ExecOutput> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(RuntimeError::InvalidCommand(
                "command must name a program".to_string(),
            ));
        }
        let name = container_name(&ws.id);
        self.ensure_running(ws, &name).await?;
        debug!(program = %command[0], args = command.len() - 1, "exec");
        self.exec_checked(&name, command.to_vec(), Vec::new()).await
    }

    #[instrument(skip_all, fields(workspace_id = %ws.id, op = ?op.command_type()))]
    pub(crate) async fn fs_workspace(&self, ws: &Workspace, op: &FsOperation) -> Result<FsOutcome> {
        let name = container_name(&ws.id);
        self.ensure_running(ws, &name).await?;

        let root = self.config.mount_target.trim_end_matches('/');
        let full = |rel: &str| {
            if rel.is_empty() {
                root.to_string()
            } else {
                format!("{root}/{rel}")
            }
        };

        match op {
            FsOperation::Tree { path, depth } => {
                let rel = confine(path.as_deref().unwrap_or(""))?;
                let depth = depth.unwrap_or(DEFAULT_TREE_DEPTH).clamp(1, MAX_TREE_DEPTH);
                let out = self
                    .exec_checked(
                        &name,
                        vec![
                            "find".into(),
                            full(&rel),
                            "-mindepth".into(),
                            "1".into(),
                            "-maxdepth".into(),
                            depth.to_string(),
                            "-printf".into(),
                            "%y %P\\n".into(),
                        ],
                        Vec::new(),
                    )
                    .await?;
                Ok(FsOutcome::Tree {
                    entries: parse_find_output(&out.stdout, &rel),
                })
            }
            FsOperation::Read { path } => {
                let rel = confine_non_root(path)?;
                let out = self
                    .exec_checked(&name, vec!["cat".into(), full(&rel)], Vec::new())
                    .await?;
                Ok(FsOutcome::Content {
                    content: out.stdout,
                })
            }
            FsOperation::Write { path, content } => {
                let rel = confine_non_root(path)?;
                let script = "mkdir -p \"$(dirname \"$1\")\" && printf '%s' \"$BERTH_CONTENT\" | base64 -d > \"$1\"";
                self.exec_checked(
                    &name,
                    vec![
                        "sh".into(),
                        "-c".into(),
                        script.into(),
                        "sh".into(),
                        full(&rel),
                    ],
                    vec![format!("BERTH_CONTENT={}", BASE64.encode(content))],
                )
                .await?;
                Ok(FsOutcome::Done)
            }
            FsOperation::Delete { path } => {
                let rel = confine_non_root(path)?;
                self.exec_checked(&name, vec!["rm".into(), "-rf".into(), full(&rel)], Vec::new())
                    .await?;
                Ok(FsOutcome::Done)
            }
            FsOperation::Rename { from, to } => {
                let from = confine_non_root(from)?;
                let to = confine_non_root(to)?;
                self.exec_checked(&name, vec!["mv".into(), full(&from), full(&to)], Vec::new())
                    .await?;
                Ok(FsOutcome::Done)
            }
            FsOperation::Mkdir { path } => {
                let rel = confine_non_root(path)?;
                self.exec_checked(&name, vec!["mkdir".into(), "-p".into(), full(&rel)], Vec::new())
                    .await?;
                Ok(FsOutcome::Done)
            }
        }
    }

    // ── Steps (caller holds the workspace lock) ──

    async fn start_locked(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        let name = container_name(&ws.id);
        let observed = self.inspect(&name).await?;
        let plan = plan_start(
            observed.as_ref(),
            &self.config.image,
            &self.config.mount_target,
            desired_mount_kind(ws.hosting_type),
        );
        debug!(?plan, state = %LifecycleState::observe(observed.as_ref()), "start plan");

        let boot = match plan {
            StartPlan::AlreadyRunning => false,
            StartPlan::StartExisting => true,
            StartPlan::Create => {
                self.create_locked(ws).await?;
                true
            }
            StartPlan::Recreate(reason) => {
                info!(%reason, "recreating container");
                self.force_remove(&name).await?;
                self.create_locked(ws).await?;
                true
            }
        };

        if boot {
            self.engine
                .start_container(&name)
                .await
                .map_err(|e| RuntimeError::engine("start_container", e))?;
            info!(state = %LifecycleState::Running, "container started");
            tokio::time::sleep(self.config.settle_delay).await;

            if let Some(url) = ws.repo_url.as_deref() {
                advisory(
                    "clone repository",
                    self.clone_if_empty(&name, url, ws.repo_token.as_deref()),
                )
                .await;
            }
        }

        advisory("install editor settings", self.install_settings(&name)).await;
        self.finish_running(ws, &name).await
    }

    async fn create_locked(&self, ws: &Workspace) -> Result<String> {
        let name = container_name(&ws.id);
        let mount = self.prepare_mount(ws).await?;
        let observed = self.inspect(&name).await?;

        let id = match (plan_create(observed.as_ref(), &self.config.image), observed) {
            (CreatePlan::Reuse, Some(info)) => {
                debug!(container_id = %info.id, "reusing existing container");
                info.id
            }
            (CreatePlan::Recreate(reason), _) => {
                info!(%reason, "recreating container");
                self.force_remove(&name).await?;
                self.create_new(ws, mount).await?
            }
            _ => self.create_new(ws, mount).await?,
        };

        self.records.begin(&ws.id, &id).await;
        Ok(id)
    }

    async fn create_new(&self, ws: &Workspace, mount: MountSpec) -> Result<String> {
        let spec = self.container_spec(ws, mount);
        info!(state = %LifecycleState::Provisioning, image = %spec.image, "creating container");

        match self.engine.create_container(&spec).await {
            Ok(id) => Ok(id),
            Err(EngineError::Conflict(msg)) => {
                debug!(%msg, "name already in use; adopting existing container");
                match self.inspect(&spec.name).await? {
                    Some(info) => Ok(info.id),
                    None => Err(RuntimeError::engine(
                        "create_container",
                        EngineError::Conflict(msg),
                    )),
                }
            }
            Err(EngineError::ImageNotFound(_)) => {
                self.pull(&spec.image).await?;
                self.engine.create_container(&spec).await.map_err(|e| match e {
                    EngineError::ImageNotFound(message) => ProvisioningError::ImagePull {
                        image: spec.image.clone(),
                        message,
                    }
                    .into(),
                    other => RuntimeError::engine("create_container", other),
                })
            }
            Err(e) => Err(RuntimeError::engine("create_container", e)),
        }
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "image not found locally; pulling");
        let progress = |line: &str| info!(image, "{line}");
        self.engine
            .pull_image(image, &progress)
            .await
            .map_err(|e| match e {
                EngineError::Unreachable(msg) => ProvisioningError::EngineUnreachable(msg),
                other => ProvisioningError::ImagePull {
                    image: image.to_string(),
                    message: other.to_string(),
                },
            })?;
        Ok(())
    }

    async fn prepare_mount(&self, ws: &Workspace) -> Result<MountSpec> {
        if !is_safe_id(&ws.id) {
            return Err(RuntimeError::InvalidPath(format!(
                "workspace id '{}' cannot be used as a directory name",
                ws.id
            )));
        }
        let target = self.config.mount_target.clone();
        match ws.hosting_type {
            HostingType::Local => {
                let path = self.config.storage_root.join("workspaces").join(&ws.id);
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|source| ProvisioningError::Mount {
                        path: path.clone(),
                        source,
                    })?;
                Ok(MountSpec::Bind {
                    source: to_engine_path(&path, self.config.engine_path_style),
                    target,
                })
            }
            HostingType::Cloud => {
                let name = volume_name(&ws.id);
                self.engine
                    .create_volume(&name)
                    .await
                    .map_err(|e| RuntimeError::engine("create_volume", e))?;
                Ok(MountSpec::Volume { name, target })
            }
        }
    }

    fn container_spec(&self, ws: &Workspace, mount: MountSpec) -> ContainerSpec {
        ContainerSpec {
            name: container_name(&ws.id),
            image: self.config.image.clone(),
            mount,
            internal_port: self.config.internal_port,
            memory_bytes: self.config.memory_bytes,
            nano_cpus: self.config.nano_cpus,
            env: Vec::new(),
            labels: HashMap::from([
                ("berth.workspace".to_string(), ws.id.clone()),
                ("berth.hosting".to_string(), ws.hosting_type.to_string()),
            ]),
        }
    }

    /// Resolve the port, poll health, and mark the record running.
    async fn finish_running(&self, ws: &Workspace, name: &str) -> Result<StartedWorkspace> {
        let info = self
            .inspect(name)
            .await?
            .ok_or_else(|| RuntimeError::engine("inspect_container", EngineError::NotFound(name.to_string())))?;
        let port = info
            .host_port(self.config.internal_port)
            .ok_or_else(|| ProvisioningError::PortBinding {
                container: name.to_string(),
                internal_port: self.config.internal_port,
            })?;

        wait_until_healthy(self.health.as_ref(), port, self.config.health).await;

        self.records.begin(&ws.id, &info.id).await;
        self.records.set_status(&ws.id, RecordStatus::Running).await;
        info!(port, "workspace running");
        Ok(StartedWorkspace {
            workspace_id: ws.id.clone(),
            port,
        })
    }

    async fn clone_if_empty(&self, name: &str, url: &str, token: Option<&str>) -> Result<()> {
        let target = self.config.mount_target.clone();
        let listing = self
            .exec_checked(name, vec!["ls".into(), "-A".into(), target.clone()], Vec::new())
            .await?;
        if !listing.stdout.trim().is_empty() {
            debug!("project directory not empty; skipping clone");
            return Ok(());
        }
        let clone_url = authenticated_clone_url(url, token);
        info!(repo = %redact(&clone_url), "cloning repository");
        self.exec_checked(
            name,
            vec!["git".into(), "clone".into(), clone_url, target],
            Vec::new(),
        )
        .await
        .map_err(|e| match e {
            // git echoes the remote URL, token included.
            RuntimeError::ExecFailed {
                command,
                exit_code,
                stderr,
            } => RuntimeError::ExecFailed {
                command,
                exit_code,
                stderr: redact_credentials(&stderr),
            },
            other => other,
        })?;
        Ok(())
    }

    async fn install_settings(&self, name: &str) -> Result<()> {
        let (cmd, env) = install_command(&self.config.settings_path, &baseline_settings());
        self.exec_checked(name, cmd, env).await?;
        Ok(())
    }

    async fn exec_checked(
        &self,
        name: &str,
        cmd: Vec<String>,
        env: Vec<String>,
    ) -> Result<ExecOutput> {
        let command = cmd.first().cloned().unwrap_or_default();
        let out = self
            .engine
            .exec(name, cmd, env)
            .await
            .map_err(|e| RuntimeError::engine("exec", e))?;
        if out.success() {
            Ok(out)
        } else {
            Err(RuntimeError::ExecFailed {
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    async fn ensure_running(&self, ws: &Workspace, name: &str) -> Result<()> {
        match self.inspect(name).await? {
            Some(info) if info.running => Ok(()),
            _ => Err(RuntimeError::ContainerNotRunning(ws.id.clone())),
        }
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        self.engine
            .inspect_container(name)
            .await
            .map_err(|e| RuntimeError::engine("inspect_container", e))
    }

    async fn force_remove(&self, name: &str) -> Result<()> {
        match self.engine.remove_container(name, true).await {
            Ok(()) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(RuntimeError::engine("remove_container", e)),
        }
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && id != "."
        && id != ".."
}

fn confine(path: &str) -> Result<String> {
    confine_path(path).map_err(RuntimeError::InvalidPath)
}

fn confine_non_root(path: &str) -> Result<String> {
    let rel = confine(path)?;
    if rel.is_empty() {
        return Err(RuntimeError::InvalidPath(
            "operation needs a path below the project root".to_string(),
        ));
    }
    Ok(rel)
}

/// Parse `find -printf '%y %P\n'` lines into entries relative to the project root.
fn parse_find_output(stdout: &str, base: &str) -> Vec<FsEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let (kind, path) = line.split_once(' ')?;
            if path.is_empty() {
                return None;
            }
            let kind = match kind {
                "d" => FsEntryKind::Dir,
                "f" => FsEntryKind::File,
                _ => FsEntryKind::Other,
            };
            let path = if base.is_empty() {
                path.to_string()
            } else {
                format!("{base}/{path}")
            };
            Some(FsEntry { path, kind })
        })
        .collect()
}
