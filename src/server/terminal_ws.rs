//! Terminal socket: `GET /terminal/{id}`.
//!
//! Messages are JSON tagged by `type` with the payload under `data`. A socket
//! subscribes to the workspace's room on connect, so it keeps receiving
//! output when the shell behind it is replaced.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use berth_runtime::TerminalEvent;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::SharedState;
use super::api::authorize;
use super::auth::Caller;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach to the workspace shell, creating it if needed.
    Init,
    /// Replace the shell with a fresh one.
    Reinit,
    Input(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready { session_id: String, shell: String },
    Output(String),
    Exit,
    Error(String),
}

pub async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    caller: Caller,
    Path(workspace_id): Path<String>,
) -> Response {
    if let Err(e) = authorize(&state, &caller, &workspace_id) {
        return e.into_response();
    }
    ws.on_upgrade(move |socket| run_terminal_socket(socket, state, workspace_id, caller))
}

type Sink = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sink, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize terminal message");
            true
        }
    }
}

async fn run_terminal_socket(socket: WebSocket, state: SharedState, workspace_id: String, caller: Caller) {
    let (mut sender, mut receiver) = socket.split();
    let mut room = state.terminals.subscribe(&workspace_id);
    debug!(%workspace_id, "terminal client connected");

    loop {
        tokio::select! {
            event = room.recv() => {
                let msg = match event {
                    Ok(TerminalEvent::Output(bytes)) => {
                        ServerMessage::Output(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Ok(TerminalEvent::Exit) => ServerMessage::Exit,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%workspace_id, skipped, "terminal client lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !send(&mut sender, &msg).await {
                    break;
                }
            }

            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(%workspace_id, error = %e, "terminal socket error");
                        break;
                    }
                };
                let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(msg) => handle_client_message(&state, &workspace_id, caller.id(), msg).await,
                    Err(e) => Some(ServerMessage::Error(format!("invalid message: {e}"))),
                };
                if let Some(reply) = reply
                    && !send(&mut sender, &reply).await
                {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    drop(room);
    state.terminals.release_room(&workspace_id);
    debug!(%workspace_id, "terminal client disconnected");
}

async fn handle_client_message(
    state: &SharedState,
    workspace_id: &str,
    caller: Option<&str>,
    msg: ClientMessage,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Init => Some(attach(state, workspace_id, caller, false).await),
        ClientMessage::Reinit => Some(attach(state, workspace_id, caller, true).await),
        ClientMessage::Input(data) => {
            // Input after the shell exited brings a new one up first.
            let live = state
                .terminals
                .session(workspace_id)
                .is_some_and(|s| s.is_live());
            if !live && let ServerMessage::Error(e) = attach(state, workspace_id, caller, false).await {
                return Some(ServerMessage::Error(e));
            }
            state.terminals.write(workspace_id, data.as_bytes()).await;
            None
        }
    }
}

async fn attach(
    state: &SharedState,
    workspace_id: &str,
    caller: Option<&str>,
    fresh: bool,
) -> ServerMessage {
    if let Err(e) = state.resolver.terminal_host(workspace_id, caller).await {
        warn!(workspace_id, error = %e, "terminal unavailable");
        return ServerMessage::Error(e.to_string());
    }
    let session = if fresh {
        state.terminals.reinitialize(workspace_id).await
    } else {
        state.terminals.get_or_create_session(workspace_id).await
    };
    match session {
        Ok(session) => ServerMessage::Ready {
            session_id: session.id().to_string(),
            shell: session.shell().to_string(),
        },
        Err(e) => {
            warn!(workspace_id, error = %e, "terminal unavailable");
            ServerMessage::Error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use berth_common::{HostingType, Workspace};
    use berth_runtime::MountKind;
    use berth_runtime::testing::{CountingProbe, FakeEngine};

    use crate::config::BerthConfig;
    use crate::server::AppState;

    fn state_with(engine: &Arc<FakeEngine>) -> SharedState {
        Arc::new(
            AppState::new(
                &BerthConfig::default(),
                engine.clone(),
                Arc::new(CountingProbe::healthy()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_init_for_agent_hosted_workspace_fails_fast() {
        let engine = Arc::new(FakeEngine::new());
        let state = state_with(&engine);
        state
            .workspaces
            .upsert(Workspace::new("w1", HostingType::Local).with_owner("alice"))
            .await;
        let (_conn, _rx) = state.relay.connect("alice");

        let reply = attach(&state, "w1", Some("alice"), false).await;
        match reply {
            ServerMessage::Error(message) => assert!(message.contains("agent"), "{message}"),
            other => panic!("Expected Error, got {:?}", other),
        }
        let reply = attach(&state, "w1", None, true).await;
        assert!(matches!(reply, ServerMessage::Error(_)));

        assert_eq!(engine.inspects(), 0);
        assert_eq!(engine.shells_opened(), 0);
        assert_eq!(state.terminals.session_count(), 0);
    }

    #[tokio::test]
    async fn test_init_for_engine_hosted_workspace_attaches() {
        let engine = Arc::new(FakeEngine::new());
        engine.seed_container("berth-ws-w1", "codercom/code-server:latest", MountKind::Bind, true);
        let state = state_with(&engine);
        state
            .workspaces
            .upsert(Workspace::new("w1", HostingType::Local).with_owner("alice"))
            .await;

        let reply = attach(&state, "w1", Some("alice"), false).await;
        assert!(matches!(reply, ServerMessage::Ready { .. }));
        assert_eq!(engine.shells_opened(), 1);
    }

    #[tokio::test]
    async fn test_input_for_agent_hosted_workspace_reports_error() {
        let engine = Arc::new(FakeEngine::new());
        let state = state_with(&engine);
        state
            .workspaces
            .upsert(Workspace::new("w1", HostingType::Local).with_owner("alice"))
            .await;
        let (_conn, _rx) = state.relay.connect("alice");

        let reply =
            handle_client_message(&state, "w1", None, ClientMessage::Input("ls\n".into())).await;
        assert!(matches!(reply, Some(ServerMessage::Error(_))));
        assert_eq!(engine.inspects(), 0);
    }

    #[test]
    fn test_client_messages_parse() {
        let init: ClientMessage = serde_json::from_str(r#"{"type":"init"}"#).unwrap();
        assert_eq!(init, ClientMessage::Init);
        let input: ClientMessage =
            serde_json::from_str(r#"{"type":"input","data":"ls -la\r"}"#).unwrap();
        assert_eq!(input, ClientMessage::Input("ls -la\r".into()));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"resize"}"#).is_err());
    }

    #[test]
    fn test_server_messages_serialize() {
        let ready = ServerMessage::Ready {
            session_id: "s1".into(),
            shell: "/bin/bash".into(),
        };
        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["type"], "ready");
        assert_eq!(json["data"]["shell"], "/bin/bash");

        let output = serde_json::to_string(&ServerMessage::Output("hi".into())).unwrap();
        assert_eq!(output, r#"{"type":"output","data":"hi"}"#);
        let exit = serde_json::to_string(&ServerMessage::Exit).unwrap();
        assert_eq!(exit, r#"{"type":"exit"}"#);
    }
}
