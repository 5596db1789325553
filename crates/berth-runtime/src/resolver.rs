//! Hosting Strategy Resolver.
//!
//! Every operation re-reads the workspace and re-checks agent connectivity,
//! then runs against one of the [`WorkspaceLifecycle`] implementations:
//! the engine-backed [`ContainerLifecycleManager`], an optional cloud
//! backend, or the owner's agent via [`AgentLifecycle`].

use std::sync::Arc;

use async_trait::async_trait;
use berth_common::{
    AgentCommand, AgentCommandType, AgentResponse, ContainerStatus, FsOperation, FsOutcome,
    HostingType, StartedWorkspace, Workspace, WorkspaceStore, confine_path,
};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::engine::ExecOutput;
use crate::error::{Result, RuntimeError};
use crate::lifecycle::ContainerLifecycleManager;
use crate::relay::AgentRelay;

/// Lifecycle operations, whoever carries them out.
#[async_trait]
pub trait WorkspaceLifecycle: Send + Sync {
    async fn start(&self, ws: &Workspace) -> Result<StartedWorkspace>;
    async fn stop(&self, ws: &Workspace) -> Result<()>;
    async fn restart(&self, ws: &Workspace) -> Result<StartedWorkspace>;
    async fn remove(&self, ws: &Workspace) -> Result<()>;
    async fn status(&self, ws: &Workspace) -> Result<ContainerStatus>;
    async fn fs(&self, ws: &Workspace, op: &FsOperation) -> Result<FsOutcome>;
    async fn exec(&self, ws: &Workspace, command: &[String]) -> Result<ExecOutput>;
}

#[async_trait]
impl WorkspaceLifecycle for ContainerLifecycleManager {
    async fn start(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        self.start_workspace(ws).await
    }

    async fn stop(&self, ws: &Workspace) -> Result<()> {
        self.stop_workspace(ws).await
    }

    async fn restart(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        self.restart_workspace(ws).await
    }

    async fn remove(&self, ws: &Workspace) -> Result<()> {
        self.remove_workspace(ws).await
    }

    async fn status(&self, ws: &Workspace) -> Result<ContainerStatus> {
        self.status_workspace(ws).await
    }

    async fn fs(&self, ws: &Workspace, op: &FsOperation) -> Result<FsOutcome> {
        self.fs_workspace(ws, op).await
    }

    async fn exec(&self, ws: &Workspace, command: &[String]) -> Result<ExecOutput> {
        self.exec_workspace(ws, command).await
    }
}

/// Lifecycle carried out by one user's agent over the relay.
pub struct AgentLifecycle {
    relay: Arc<AgentRelay>,
    user_id: String,
}

impl AgentLifecycle {
    pub fn new(relay: Arc<AgentRelay>, user_id: impl Into<String>) -> Self {
        Self {
            relay,
            user_id: user_id.into(),
        }
    }

    async fn send(&self, ws: &Workspace, kind: AgentCommandType, options: Option<Value>) -> Result<AgentResponse> {
        let mut command = AgentCommand::new(kind).for_workspace(&ws.id);
        if let Some(options) = options {
            command = command.with_options(options);
        }
        self.relay.send_command(&self.user_id, command).await
    }

    fn start_options(ws: &Workspace) -> Value {
        let mut options = Map::new();
        if let Some(url) = &ws.repo_url {
            options.insert("repoUrl".into(), json!(url));
        }
        if let Some(token) = &ws.repo_token {
            options.insert("repoToken".into(), json!(token));
        }
        if let Some(port) = ws.local_port {
            options.insert("localPort".into(), json!(port));
        }
        Value::Object(options)
    }

    /// The agent reports the port it published; fall back to the workspace hint.
    fn started(ws: &Workspace, response: &AgentResponse) -> Result<StartedWorkspace> {
        let port = response
            .get("port")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .and_then(|p| u16::try_from(p).ok())
            .or(ws.local_port)
            .ok_or_else(|| {
                RuntimeError::Protocol(format!(
                    "agent did not report a port for workspace {}",
                    ws.id
                ))
            })?;
        Ok(StartedWorkspace {
            workspace_id: ws.id.clone(),
            port,
        })
    }
}

#[async_trait]
impl WorkspaceLifecycle for AgentLifecycle {
    async fn start(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        let response = self
            .send(ws, AgentCommandType::ContainerStart, Some(Self::start_options(ws)))
            .await?;
        Self::started(ws, &response)
    }

    async fn stop(&self, ws: &Workspace) -> Result<()> {
        self.send(ws, AgentCommandType::ContainerStop, None).await?;
        Ok(())
    }

    async fn restart(&self, ws: &Workspace) -> Result<StartedWorkspace> {
        let response = self
            .send(ws, AgentCommandType::ContainerRestart, Some(Self::start_options(ws)))
            .await?;
        Self::started(ws, &response)
    }

    async fn remove(&self, ws: &Workspace) -> Result<()> {
        self.send(ws, AgentCommandType::ContainerRemove, None).await?;
        Ok(())
    }

    async fn status(&self, ws: &Workspace) -> Result<ContainerStatus> {
        let response = self.send(ws, AgentCommandType::ContainerStatus, None).await?;
        let raw = response.get("status").cloned().unwrap_or(Value::Null);
        serde_json::from_value::<ContainerStatus>(raw.clone()).map_err(|_| {
            RuntimeError::Protocol(format!(
                "agent reported unrecognized status {raw} for workspace {}",
                ws.id
            ))
        })
    }

    async fn fs(&self, ws: &Workspace, op: &FsOperation) -> Result<FsOutcome> {
        for path in op.paths() {
            confine_path(path).map_err(RuntimeError::InvalidPath)?;
        }
        let response = self
            .relay
            .send_command(&self.user_id, op.to_command(&ws.id))
            .await?;
        Ok(FsOutcome::from_agent(op, &response))
    }

    async fn exec(&self, ws: &Workspace, command: &[String]) -> Result<ExecOutput> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(RuntimeError::InvalidCommand(
                "command must name a program".to_string(),
            ));
        }
        let response = self
            .send(ws, AgentCommandType::Exec, Some(json!({ "command": command })))
            .await?;
        let text = |key: &str| {
            response
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let exit_code = response
            .get("exitCode")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                RuntimeError::Protocol(format!(
                    "agent did not report an exit code for workspace {}",
                    ws.id
                ))
            })?;
        let out = ExecOutput {
            exit_code,
            stdout: text("stdout"),
            stderr: text("stderr"),
        };
        if out.success() {
            Ok(out)
        } else {
            Err(RuntimeError::ExecFailed {
                command: command[0].clone(),
                exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Where one operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Engine,
    Cloud,
    Agent { user_id: String },
}

pub struct HostingResolver {
    workspaces: Arc<dyn WorkspaceStore>,
    relay: Arc<AgentRelay>,
    engine: Arc<ContainerLifecycleManager>,
    cloud: Option<Arc<dyn WorkspaceLifecycle>>,
}

impl HostingResolver {
    pub fn new(
        workspaces: Arc<dyn WorkspaceStore>,
        relay: Arc<AgentRelay>,
        engine: Arc<ContainerLifecycleManager>,
    ) -> Self {
        Self {
            workspaces,
            relay,
            engine,
            cloud: None,
        }
    }

    /// Serve CLOUD workspaces from an alternate backend instead of the engine.
    pub fn with_cloud_backend(mut self, cloud: Arc<dyn WorkspaceLifecycle>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn relay(&self) -> &Arc<AgentRelay> {
        &self.relay
    }

    pub fn engine_lifecycle(&self) -> &Arc<ContainerLifecycleManager> {
        &self.engine
    }

    pub async fn workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.workspaces
            .get_workspace(workspace_id)
            .await
            .ok_or_else(|| RuntimeError::WorkspaceNotFound(workspace_id.to_string()))
    }

    /// LOCAL with a live agent goes to the agent; the caller's agent is
    /// preferred, then the owner's.
    pub fn route_for(&self, ws: &Workspace, caller: Option<&str>) -> Route {
        if ws.hosting_type == HostingType::Local {
            let candidates = caller.into_iter().chain(ws.owner_id.as_deref());
            for user_id in candidates {
                if self.relay.is_connected(user_id) {
                    return Route::Agent {
                        user_id: user_id.to_string(),
                    };
                }
            }
        }
        if ws.hosting_type == HostingType::Cloud && self.cloud.is_some() {
            return Route::Cloud;
        }
        Route::Engine
    }

    /// Terminals only attach to engine-hosted containers. A workspace the
    /// agent or a cloud backend serves fails here, before any engine call.
    pub async fn terminal_host(&self, workspace_id: &str, caller: Option<&str>) -> Result<Workspace> {
        let ws = self.workspace(workspace_id).await?;
        let reason = match self.route_for(&ws, caller) {
            Route::Engine => return Ok(ws),
            Route::Agent { user_id } => {
                format!("workspace is served by the agent of user {user_id}")
            }
            Route::Cloud => "workspace is served by the cloud backend".to_string(),
        };
        debug!(workspace_id, %reason, "terminal not hosted locally");
        Err(RuntimeError::TerminalUnavailable {
            workspace_id: workspace_id.to_string(),
            reason,
        })
    }

    async fn resolve(
        &self,
        workspace_id: &str,
        caller: Option<&str>,
    ) -> Result<(Workspace, Arc<dyn WorkspaceLifecycle>)> {
        let ws = self.workspace(workspace_id).await?;
        let route = self.route_for(&ws, caller);
        debug!(workspace_id, ?route, hosting = %ws.hosting_type, "resolved hosting route");
        let backend: Arc<dyn WorkspaceLifecycle> = match route {
            Route::Agent { user_id } => Arc::new(AgentLifecycle::new(Arc::clone(&self.relay), user_id)),
            Route::Cloud => match &self.cloud {
                Some(cloud) => Arc::clone(cloud),
                None => self.engine.clone(),
            },
            Route::Engine => self.engine.clone(),
        };
        Ok((ws, backend))
    }

    pub async fn start(&self, workspace_id: &str, caller: Option<&str>) -> Result<StartedWorkspace> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.start(&ws).await
    }

    pub async fn stop(&self, workspace_id: &str, caller: Option<&str>) -> Result<()> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.stop(&ws).await
    }

    pub async fn restart(&self, workspace_id: &str, caller: Option<&str>) -> Result<StartedWorkspace> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.restart(&ws).await
    }

    pub async fn remove(&self, workspace_id: &str, caller: Option<&str>) -> Result<()> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.remove(&ws).await
    }

    pub async fn status(&self, workspace_id: &str, caller: Option<&str>) -> Result<ContainerStatus> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.status(&ws).await
    }

    pub async fn fs(
        &self,
        workspace_id: &str,
        caller: Option<&str>,
        op: &FsOperation,
    ) -> Result<FsOutcome> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.fs(&ws, op).await
    }

    pub async fn exec(
        &self,
        workspace_id: &str,
        caller: Option<&str>,
        command: &[String],
    ) -> Result<ExecOutput> {
        let (ws, backend) = self.resolve(workspace_id, caller).await?;
        backend.exec(&ws, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use berth_common::{MemoryWorkspaceStore, ServerFrame};

    use crate::health::HealthPolicy;
    use crate::lifecycle::LifecycleConfig;
    use crate::records::MemoryRecordStore;
    use crate::testing::{CountingProbe, FakeEngine};

    struct Setup {
        engine: Arc<FakeEngine>,
        relay: Arc<AgentRelay>,
        resolver: HostingResolver,
        _dir: tempfile::TempDir,
    }

    fn setup(workspaces: Vec<Workspace>) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let store: Arc<dyn WorkspaceStore> = Arc::new(MemoryWorkspaceStore::with_workspaces(workspaces));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            engine.clone(),
            Arc::clone(&store),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(CountingProbe::healthy()),
            LifecycleConfig {
                storage_root: dir.path().to_path_buf(),
                settle_delay: Duration::ZERO,
                health: HealthPolicy {
                    interval: Duration::from_millis(1),
                    max_attempts: 1,
                },
                ..LifecycleConfig::default()
            },
        ));
        let relay = Arc::new(AgentRelay::new());
        let resolver = HostingResolver::new(store, Arc::clone(&relay), lifecycle);
        Setup {
            engine,
            relay,
            resolver,
            _dir: dir,
        }
    }

    /// Answer every command with `reply` until the channel closes.
    fn spawn_agent(
        relay: Arc<AgentRelay>,
        mut rx: crate::relay::FrameReceiver,
        reply: Value,
    ) -> tokio::task::JoinHandle<Vec<AgentCommand>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = rx.recv().await {
                if let ServerFrame::Command { id, command } = frame {
                    seen.push(command);
                    relay.handle_frame(berth_common::AgentFrame::CommandResponse {
                        id,
                        response: AgentResponse::ok(reply.clone()),
                    });
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_local_without_agent_uses_engine() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let ws = s.resolver.workspace("w1").await.unwrap();
        assert_eq!(s.resolver.route_for(&ws, Some("u1")), Route::Engine);

        s.resolver.start("w1", Some("u1")).await.unwrap();
        assert_eq!(s.engine.creates(), 1);
    }

    #[tokio::test]
    async fn test_local_with_agent_routes_to_agent() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local)
            .with_owner("u1")
            .with_repo("https://github.com/acme/app", Some("tok".into()))]);
        let (_conn, rx) = s.relay.connect("u1");
        let agent = spawn_agent(Arc::clone(&s.relay), rx, json!({"port": 3000}));

        let started = s.resolver.start("w1", None).await.unwrap();
        assert_eq!(started.port, 3000);
        assert_eq!(s.engine.creates(), 0);

        // Connectivity is re-checked on every call.
        let conn = s.relay.registry().connection_id("u1").unwrap();
        s.relay.disconnect("u1", &conn);
        s.resolver.start("w1", None).await.unwrap();
        assert_eq!(s.engine.creates(), 1);

        let seen = agent.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, AgentCommandType::ContainerStart);
        let options = seen[0].options.as_ref().unwrap();
        assert_eq!(options["repoUrl"], "https://github.com/acme/app");
    }

    #[tokio::test]
    async fn test_cloud_ignores_agent() {
        let s = setup(vec![Workspace::new("w1", HostingType::Cloud).with_owner("u1")]);
        let (_conn, _rx) = s.relay.connect("u1");
        let ws = s.resolver.workspace("w1").await.unwrap();
        assert_eq!(s.resolver.route_for(&ws, Some("u1")), Route::Engine);
    }

    #[tokio::test]
    async fn test_agent_status_and_fs() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let (_conn, rx) = s.relay.connect("u1");
        spawn_agent(
            Arc::clone(&s.relay),
            rx,
            json!({"status": "RUNNING", "content": "fn main() {}"}),
        );

        assert_eq!(
            s.resolver.status("w1", Some("u1")).await.unwrap(),
            ContainerStatus::Running
        );
        let read = s
            .resolver
            .fs("w1", Some("u1"), &FsOperation::Read { path: "src/main.rs".into() })
            .await
            .unwrap();
        assert_eq!(read, FsOutcome::Content { content: "fn main() {}".into() });

        let escaped = s
            .resolver
            .fs("w1", Some("u1"), &FsOperation::Read { path: "../secret".into() })
            .await;
        assert!(matches!(escaped, Err(RuntimeError::InvalidPath(_))));
    }

    #[tokio::test]
    async fn test_agent_start_without_port_uses_local_port_hint() {
        let mut ws = Workspace::new("w1", HostingType::Local).with_owner("u1");
        ws.local_port = Some(8443);
        let s = setup(vec![ws]);
        let (_conn, rx) = s.relay.connect("u1");
        spawn_agent(Arc::clone(&s.relay), rx, json!({}));
        assert_eq!(s.resolver.start("w1", None).await.unwrap().port, 8443);
    }

    struct CountingCloud {
        starts: AtomicU32,
    }

    #[async_trait]
    impl WorkspaceLifecycle for CountingCloud {
        async fn start(&self, ws: &Workspace) -> Result<StartedWorkspace> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(StartedWorkspace {
                workspace_id: ws.id.clone(),
                port: 443,
            })
        }
        async fn stop(&self, _ws: &Workspace) -> Result<()> {
            Ok(())
        }
        async fn restart(&self, ws: &Workspace) -> Result<StartedWorkspace> {
            self.start(ws).await
        }
        async fn remove(&self, _ws: &Workspace) -> Result<()> {
            Ok(())
        }
        async fn status(&self, _ws: &Workspace) -> Result<ContainerStatus> {
            Ok(ContainerStatus::Running)
        }
        async fn fs(&self, _ws: &Workspace, _op: &FsOperation) -> Result<FsOutcome> {
            Ok(FsOutcome::Done)
        }
        async fn exec(&self, _ws: &Workspace, _command: &[String]) -> Result<ExecOutput> {
            Ok(ExecOutput::default())
        }
    }

    #[tokio::test]
    async fn test_cloud_backend_replaces_engine_for_cloud() {
        let s = setup(vec![
            Workspace::new("cloud", HostingType::Cloud),
            Workspace::new("local", HostingType::Local),
        ]);
        let cloud = Arc::new(CountingCloud {
            starts: AtomicU32::new(0),
        });
        let resolver = s.resolver.with_cloud_backend(cloud.clone());

        assert_eq!(resolver.start("cloud", None).await.unwrap().port, 443);
        resolver.start("local", None).await.unwrap();
        assert_eq!(cloud.starts.load(Ordering::SeqCst), 1);
        assert_eq!(s.engine.creates(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workspace() {
        let s = setup(vec![]);
        assert!(matches!(
            s.resolver.stop("ghost", None).await,
            Err(RuntimeError::WorkspaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_agent_status_rejects_unknown_value() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let (_conn, rx) = s.relay.connect("u1");
        spawn_agent(Arc::clone(&s.relay), rx, json!({"status": "EXPLODED"}));

        let err = s.resolver.status("w1", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(ref m) if m.contains("EXPLODED")));
    }

    #[tokio::test]
    async fn test_agent_status_without_value_is_protocol_error() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let (_conn, rx) = s.relay.connect("u1");
        spawn_agent(Arc::clone(&s.relay), rx, json!({}));

        let err = s.resolver.status("w1", None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_exec_on_engine() {
        let s = setup(vec![Workspace::new("w1", HostingType::Cloud)]);
        s.resolver.start("w1", None).await.unwrap();
        s.engine.set_exec_stdout("ls", "Cargo.toml\n");

        let cmd = vec!["ls".to_string(), "-1".to_string()];
        let out = s.resolver.exec("w1", None, &cmd).await.unwrap();
        assert_eq!(out.stdout, "Cargo.toml\n");
        assert_eq!(out.exit_code, 0);
        assert!(s.engine.exec_log().contains(&cmd));
    }

    #[tokio::test]
    async fn test_exec_on_agent() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let (_conn, rx) = s.relay.connect("u1");
        let agent = spawn_agent(
            Arc::clone(&s.relay),
            rx,
            json!({"exitCode": 0, "stdout": "main\n", "stderr": ""}),
        );

        let cmd = vec!["git".to_string(), "branch".to_string(), "--show-current".to_string()];
        let out = s.resolver.exec("w1", Some("u1"), &cmd).await.unwrap();
        assert_eq!(out.stdout, "main\n");
        assert!(s.engine.exec_log().is_empty());

        let conn = s.relay.registry().connection_id("u1").unwrap();
        s.relay.disconnect("u1", &conn);
        let seen = agent.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, AgentCommandType::Exec);
        assert_eq!(seen[0].workspace_id.as_deref(), Some("w1"));
        assert_eq!(seen[0].options.as_ref().unwrap()["command"], json!(cmd));
    }

    #[tokio::test]
    async fn test_agent_exec_nonzero_exit_fails() {
        let s = setup(vec![Workspace::new("w1", HostingType::Local).with_owner("u1")]);
        let (_conn, rx) = s.relay.connect("u1");
        spawn_agent(
            Arc::clone(&s.relay),
            rx,
            json!({"exitCode": 2, "stdout": "", "stderr": "no such file\n"}),
        );

        let err = s
            .resolver
            .exec("w1", None, &["cat".to_string(), "missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ExecFailed { exit_code: 2, ref stderr, .. } if stderr == "no such file"
        ));
    }

    #[tokio::test]
    async fn test_terminal_host_refuses_agent_route_without_engine() {
        let s = setup(vec![
            Workspace::new("agent-ws", HostingType::Local).with_owner("u1"),
            Workspace::new("engine-ws", HostingType::Local).with_owner("u2"),
        ]);
        let (_conn, _rx) = s.relay.connect("u1");

        let err = s.resolver.terminal_host("agent-ws", None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::TerminalUnavailable { ref workspace_id, .. } if workspace_id == "agent-ws"
        ));
        assert_eq!(s.engine.inspects(), 0);

        let ws = s.resolver.terminal_host("engine-ws", None).await.unwrap();
        assert_eq!(ws.id, "engine-ws");
    }
}
