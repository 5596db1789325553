//! Remote Agent Relay.
//!
//! One persistent socket per user carries correlated commands and tunneled
//! HTTP requests to that user's agent. The socket task owns the receiving
//! half of the frame channel handed out by [`AgentRelay::connect`] and feeds
//! inbound frames back through [`AgentRelay::handle_text`].

use std::time::Duration;

use berth_common::{AgentCommand, AgentFrame, AgentResponse, ServerFrame, TunnelRequest};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::{CorrelationError, Correlator};
use crate::error::{Result, RuntimeError};
use crate::tunnel::{TunnelResponse, TunnelTable};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<ServerFrame>;

#[derive(Debug, Clone)]
struct AgentConnection {
    connection_id: String,
    sender: FrameSender,
}

/// Live agent connections, at most one per user.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    connections: DashMap<String, AgentConnection>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport for `user_id`, replacing any previous one.
    /// Returns the new connection id.
    pub fn register(&self, user_id: &str, sender: FrameSender) -> String {
        let connection_id = Uuid::new_v4().to_string();
        let previous = self.connections.insert(
            user_id.to_string(),
            AgentConnection {
                connection_id: connection_id.clone(),
                sender,
            },
        );
        match previous {
            Some(old) => info!(
                user_id,
                %connection_id,
                replaced = %old.connection_id,
                "agent reconnected; previous connection replaced"
            ),
            None => info!(user_id, %connection_id, "agent connected"),
        }
        connection_id
    }

    /// Remove the entry only if `connection_id` is still the registered one.
    pub fn unregister(&self, user_id: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(user_id, |_, conn| conn.connection_id == connection_id)
            .is_some();
        if removed {
            info!(user_id, connection_id, "agent disconnected");
        } else {
            debug!(user_id, connection_id, "stale agent connection closed");
        }
        removed
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections
            .get(user_id)
            .is_some_and(|conn| !conn.sender.is_closed())
    }

    pub fn connection_id(&self, user_id: &str) -> Option<String> {
        self.connections
            .get(user_id)
            .map(|conn| conn.connection_id.clone())
    }

    fn sender(&self, user_id: &str) -> Option<FrameSender> {
        self.connections
            .get(user_id)
            .map(|conn| conn.sender.clone())
            .filter(|sender| !sender.is_closed())
    }

    pub fn connected_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| !entry.sender.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        users.sort();
        users
    }
}

pub struct AgentRelay {
    registry: AgentRegistry,
    commands: Correlator<AgentResponse>,
    tunnels: TunnelTable,
    command_timeout: Duration,
    tunnel_timeout: Duration,
}

impl Default for AgentRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRelay {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_COMMAND_TIMEOUT, DEFAULT_TUNNEL_TIMEOUT)
    }

    pub fn with_timeouts(command_timeout: Duration, tunnel_timeout: Duration) -> Self {
        Self {
            registry: AgentRegistry::new(),
            commands: Correlator::new(),
            tunnels: TunnelTable::new(),
            command_timeout,
            tunnel_timeout,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Register a new transport for `user_id`. The socket task drains the
    /// returned receiver onto the wire.
    pub fn connect(&self, user_id: &str) -> (String, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.registry.register(user_id, tx);
        (connection_id, rx)
    }

    /// Commands still in flight on this connection are not retried; they
    /// run out their deadline.
    pub fn disconnect(&self, user_id: &str, connection_id: &str) -> bool {
        self.registry.unregister(user_id, connection_id)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.registry.is_connected(user_id)
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    pub fn open_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Send one command and wait for its correlated response.
    pub async fn send_command(&self, user_id: &str, command: AgentCommand) -> Result<AgentResponse> {
        let sender = self
            .registry
            .sender(user_id)
            .ok_or_else(|| RuntimeError::AgentUnavailable {
                user_id: user_id.to_string(),
            })?;

        let kind = command.kind;
        let id = Uuid::new_v4().to_string();
        let rx = self.commands.register(&id, self.command_timeout);
        debug!(user_id, %id, command = %kind, "dispatching agent command");

        let sent = sender.send(ServerFrame::Command {
            id: id.clone(),
            command,
        });
        // A replaced connection's channel must close without waiting on us.
        drop(sender);
        if sent.is_err() {
            self.commands.reject(&id);
            return Err(RuntimeError::AgentUnavailable {
                user_id: user_id.to_string(),
            });
        }

        let response = self
            .commands
            .wait(&id, rx, self.command_timeout)
            .await
            .map_err(|e| match e {
                CorrelationError::Timeout(after) => {
                    warn!(user_id, %id, command = %kind, "agent command timed out");
                    RuntimeError::CommandTimeout {
                        command: kind.to_string(),
                        after,
                    }
                }
                CorrelationError::Cancelled => RuntimeError::AgentDisconnected {
                    user_id: user_id.to_string(),
                },
            })?;

        match response.failure() {
            Some(message) => Err(RuntimeError::AgentCommandFailed {
                command: kind.to_string(),
                message,
            }),
            None => Ok(response),
        }
    }

    /// Tunnel one HTTP request through the agent.
    pub async fn open_tunnel(&self, user_id: &str, request: TunnelRequest) -> Result<TunnelResponse> {
        let sender = self
            .registry
            .sender(user_id)
            .ok_or_else(|| RuntimeError::AgentUnavailable {
                user_id: user_id.to_string(),
            })?;

        let id = Uuid::new_v4().to_string();
        let pending = self.tunnels.open(&id);
        debug!(user_id, %id, method = %request.method, path = %request.path, "opening tunnel");

        let sent = sender.send(ServerFrame::HttpRequest {
            id: id.clone(),
            request,
        });
        drop(sender);
        if sent.is_err() {
            self.tunnels.cancel(&id);
            return Err(RuntimeError::AgentUnavailable {
                user_id: user_id.to_string(),
            });
        }

        Ok(pending.response(self.tunnel_timeout).await)
    }

    /// Route an inbound frame. Returns false if nothing was waiting for it.
    pub fn handle_frame(&self, frame: AgentFrame) -> bool {
        match frame {
            AgentFrame::CommandResponse { id, response } => {
                let delivered = self.commands.resolve(&id, response);
                if !delivered {
                    debug!(%id, "response for unknown or settled command ignored");
                }
                delivered
            }
            other => self.tunnels.handle(other),
        }
    }

    /// Parse and route one text frame from the agent socket.
    pub fn handle_text(&self, text: &str) -> Result<bool> {
        let frame: AgentFrame = serde_json::from_str(text)
            .map_err(|e| RuntimeError::Protocol(format!("invalid agent frame: {e}")))?;
        Ok(self.handle_frame(frame))
    }

    /// Drop command entries whose deadline passed without a waiter noticing.
    pub fn sweep_expired(&self) -> usize {
        self.commands.sweep_expired()
    }
}
