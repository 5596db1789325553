//! Terminal Session Multiplexer.
//!
//! At most one interactive shell per workspace. Output is broadcast to the
//! workspace's room, which outlives individual sessions so subscribers keep
//! receiving output across a re-initialization or a self-heal. A room is
//! dropped once it has neither a session nor a subscriber.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::ContainerEngine;
use crate::error::{EngineError, Result, RuntimeError};
use crate::lifecycle::container_name;
use crate::single_flight::KeyedMutex;

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Tried in order; the first that runs is used.
    pub shells: Vec<String>,
    /// How long to wait for the container to be running.
    pub wait_attempts: u32,
    pub wait_interval: Duration,
    pub room_capacity: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shells: vec![
                "/bin/bash".to_string(),
                "bash".to_string(),
                "/bin/sh".to_string(),
                "sh".to_string(),
            ],
            wait_attempts: 30,
            wait_interval: Duration::from_secs(1),
            room_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(Bytes),
    /// The current session ended; the next input or init starts a new one.
    Exit,
}

pub struct TerminalSession {
    id: String,
    workspace_id: String,
    shell: String,
    writer: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    live: AtomicBool,
}

impl TerminalSession {
    fn new(workspace_id: &str, shell: &str, writer: Pin<Box<dyn AsyncWrite + Send>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            shell: shell.to_string(),
            writer: Mutex::new(writer),
            live: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Serialized write. Never fails: a dead or broken session drops the
    /// input with a warning and is marked dead.
    pub async fn write(&self, data: &[u8]) -> bool {
        let mut writer = self.writer.lock().await;
        if !self.is_live() {
            warn!(workspace_id = %self.workspace_id, "terminal session not writable; input dropped");
            return false;
        }
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(workspace_id = %self.workspace_id, error = %e, "terminal write failed; session marked dead");
                self.mark_dead();
                false
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        self.mark_dead();
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.id)
            .field("workspace_id", &self.workspace_id)
            .field("shell", &self.shell)
            .field("live", &self.is_live())
            .finish()
    }
}

type Sessions = Arc<DashMap<String, Arc<TerminalSession>>>;

pub struct TerminalMultiplexer {
    engine: Arc<dyn ContainerEngine>,
    config: TerminalConfig,
    sessions: Sessions,
    rooms: DashMap<String, broadcast::Sender<TerminalEvent>>,
    locks: KeyedMutex,
}

impl TerminalMultiplexer {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: TerminalConfig) -> Self {
        Self {
            engine,
            config,
            sessions: Arc::new(DashMap::new()),
            rooms: DashMap::new(),
            locks: KeyedMutex::new(),
        }
    }

    fn room(&self, workspace_id: &str) -> broadcast::Sender<TerminalEvent> {
        self.rooms
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(self.config.room_capacity).0)
            .clone()
    }

    /// Subscribes under the map entry lock so a concurrent release cannot
    /// drop the room in between.
    pub fn subscribe(&self, workspace_id: &str) -> broadcast::Receiver<TerminalEvent> {
        self.rooms
            .entry(workspace_id.to_string())
            .or_insert_with(|| broadcast::channel(self.config.room_capacity).0)
            .subscribe()
    }

    /// Drop the workspace's room if no session feeds it and nobody listens.
    pub fn release_room(&self, workspace_id: &str) -> bool {
        if self.sessions.contains_key(workspace_id) {
            return false;
        }
        let released = self
            .rooms
            .remove_if(workspace_id, |_, room| room.receiver_count() == 0)
            .is_some();
        if released {
            debug!(workspace_id, "released idle terminal room");
        }
        released
    }

    /// Sweep idle rooms and uncontended per-workspace locks.
    pub fn prune(&self) {
        self.locks.prune();
        self.rooms
            .retain(|id, room| room.receiver_count() > 0 || self.sessions.contains_key(id));
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn session(&self, workspace_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.get(workspace_id).map(|s| Arc::clone(&s))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Live session for the workspace; stale entries are discarded.
    fn live_session(&self, workspace_id: &str) -> Option<Arc<TerminalSession>> {
        let session = self.session(workspace_id)?;
        if session.is_live() {
            return Some(session);
        }
        self.sessions
            .remove_if(workspace_id, |_, s| s.id == session.id);
        debug!(workspace_id, "discarded stale terminal session");
        None
    }

    pub async fn get_or_create_session(&self, workspace_id: &str) -> Result<Arc<TerminalSession>> {
        if let Some(session) = self.live_session(workspace_id) {
            return Ok(session);
        }
        let _guard = self.locks.lock(workspace_id).await;
        if let Some(session) = self.live_session(workspace_id) {
            return Ok(session);
        }
        self.create_locked(workspace_id).await
    }

    /// Tear down the current session (if any) and start a fresh one.
    pub async fn reinitialize(&self, workspace_id: &str) -> Result<Arc<TerminalSession>> {
        let _guard = self.locks.lock(workspace_id).await;
        if let Some((_, old)) = self.sessions.remove(workspace_id) {
            info!(workspace_id, session_id = %old.id, "re-initializing terminal session");
            old.close().await;
        }
        self.create_locked(workspace_id).await
    }

    /// Forward input to the workspace's session. Never fails.
    pub async fn write(&self, workspace_id: &str, data: &[u8]) {
        let Some(session) = self.session(workspace_id) else {
            warn!(workspace_id, "no terminal session; input dropped");
            return;
        };
        if !session.write(data).await {
            self.sessions
                .remove_if(workspace_id, |_, s| s.id == session.id);
        }
    }

    /// Close the session and drop the room and lock if nothing else uses them.
    pub async fn close(&self, workspace_id: &str) -> bool {
        let closed = match self.sessions.remove(workspace_id) {
            Some((_, session)) => {
                session.close().await;
                info!(workspace_id, "terminal session closed");
                true
            }
            None => false,
        };
        self.release_room(workspace_id);
        self.locks.release(workspace_id);
        closed
    }

    async fn create_locked(&self, workspace_id: &str) -> Result<Arc<TerminalSession>> {
        let name = container_name(workspace_id);
        self.wait_running(workspace_id, &name).await?;
        let shell = self.pick_shell(workspace_id, &name).await?;

        let stream = self
            .engine
            .exec_interactive(&name, &shell)
            .await
            .map_err(|e| unavailable(workspace_id, e.to_string()))?;

        let session = Arc::new(TerminalSession::new(workspace_id, &shell, stream.input));
        self.sessions
            .insert(workspace_id.to_string(), Arc::clone(&session));
        info!(workspace_id, session_id = %session.id, %shell, "terminal session started");

        tokio::spawn(pump_output(
            stream.output,
            Arc::clone(&session),
            Arc::clone(&self.sessions),
            self.room(workspace_id),
        ));
        Ok(session)
    }

    async fn wait_running(&self, workspace_id: &str, name: &str) -> Result<()> {
        for attempt in 1..=self.config.wait_attempts {
            match self.engine.inspect_container(name).await {
                Ok(Some(info)) if info.running => return Ok(()),
                Ok(_) => debug!(workspace_id, attempt, "waiting for container to run"),
                Err(e) => return Err(unavailable(workspace_id, e.to_string())),
            }
            if attempt < self.config.wait_attempts {
                tokio::time::sleep(self.config.wait_interval).await;
            }
        }
        Err(unavailable(workspace_id, "container is not running".to_string()))
    }

    async fn pick_shell(&self, workspace_id: &str, name: &str) -> Result<String> {
        for shell in &self.config.shells {
            let probe = self
                .engine
                .exec(
                    name,
                    vec![shell.clone(), "-c".to_string(), "exit 0".to_string()],
                    Vec::new(),
                )
                .await;
            match probe {
                Ok(out) if out.success() => return Ok(shell.clone()),
                Ok(out) => debug!(workspace_id, %shell, exit_code = out.exit_code, "shell unavailable"),
                Err(EngineError::Unreachable(msg)) => return Err(unavailable(workspace_id, msg)),
                Err(e) => debug!(workspace_id, %shell, error = %e, "shell probe failed"),
            }
        }
        Err(unavailable(workspace_id, "no usable shell in container".to_string()))
    }
}

fn unavailable(workspace_id: &str, reason: String) -> RuntimeError {
    RuntimeError::TerminalUnavailable {
        workspace_id: workspace_id.to_string(),
        reason,
    }
}

async fn pump_output(
    mut output: BoxStream<'static, std::result::Result<Bytes, EngineError>>,
    session: Arc<TerminalSession>,
    sessions: Sessions,
    room: broadcast::Sender<TerminalEvent>,
) {
    while let Some(chunk) = output.next().await {
        if !session.is_live() {
            break;
        }
        match chunk {
            Ok(bytes) => {
                // No subscribers is fine.
                let _ = room.send(TerminalEvent::Output(bytes));
            }
            Err(e) => {
                warn!(workspace_id = %session.workspace_id, error = %e, "terminal stream error");
                break;
            }
        }
    }

    session.mark_dead();
    let was_current = sessions
        .remove_if(&session.workspace_id, |_, s| s.id == session.id)
        .is_some();
    if was_current {
        let _ = room.send(TerminalEvent::Exit);
        info!(workspace_id = %session.workspace_id, session_id = %session.id, "terminal session ended");
    }
}
