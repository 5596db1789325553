//! Agent wire protocol.
//!
//! Every frame is a JSON text message tagged by `event`. The server sends
//! [`ServerFrame`]s; the agent answers with [`AgentFrame`]s carrying the same
//! correlation `id`.
//!
//! | Event                        | Direction      | Meaning                              |
//! |------------------------------|----------------|--------------------------------------|
//! | `agent-command`              | server → agent | run a filesystem/container command   |
//! | `agent-command:response`     | agent → server | single reply to an `agent-command`   |
//! | `proxy:http:request`         | server → agent | tunnel one HTTP request              |
//! | `proxy:http:response:start`  | agent → server | status line + headers                |
//! | `proxy:http:response:chunk`  | agent → server | base64 body bytes, in order          |
//! | `proxy:http:response:end`    | agent → server | body complete                        |
//! | `proxy:http:response:error`  | agent → server | tunnel failed                        |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommandType {
    FsTree,
    FsRead,
    FsWrite,
    FsDelete,
    FsRename,
    FsMkdir,
    ContainerStart,
    ContainerStop,
    ContainerRestart,
    ContainerRemove,
    ContainerStatus,
    Exec,
}

impl AgentCommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentCommandType::FsTree => "FS_TREE",
            AgentCommandType::FsRead => "FS_READ",
            AgentCommandType::FsWrite => "FS_WRITE",
            AgentCommandType::FsDelete => "FS_DELETE",
            AgentCommandType::FsRename => "FS_RENAME",
            AgentCommandType::FsMkdir => "FS_MKDIR",
            AgentCommandType::ContainerStart => "CONTAINER_START",
            AgentCommandType::ContainerStop => "CONTAINER_STOP",
            AgentCommandType::ContainerRestart => "CONTAINER_RESTART",
            AgentCommandType::ContainerRemove => "CONTAINER_REMOVE",
            AgentCommandType::ContainerStatus => "CONTAINER_STATUS",
            AgentCommandType::Exec => "EXEC",
        }
    }
}

impl std::fmt::Display for AgentCommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCommand {
    #[serde(rename = "type")]
    pub kind: AgentCommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl AgentCommand {
    pub fn new(kind: AgentCommandType) -> Self {
        Self {
            kind,
            workspace_id: None,
            options: None,
        }
    }

    pub fn for_workspace(mut self, workspace_id: &str) -> Self {
        self.workspace_id = Some(workspace_id.to_string());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }
}

/// Callback-style reply: `{success?, error?, ...payload}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl AgentResponse {
    pub fn ok(payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            success: Some(true),
            error: None,
            payload,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(message.into()),
            payload: Map::new(),
        }
    }

    /// The agent's error message, if the reply signals failure.
    ///
    /// A reply without `success` and without `error` counts as success.
    pub fn failure(&self) -> Option<String> {
        match (&self.error, self.success) {
            (Some(err), _) => Some(err.clone()),
            (None, Some(false)) => Some("agent reported failure".to_string()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// One tunneled HTTP request. `body` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRequest {
    pub workspace_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerFrame {
    #[serde(rename = "agent-command")]
    Command { id: String, command: AgentCommand },
    #[serde(rename = "proxy:http:request")]
    HttpRequest { id: String, request: TunnelRequest },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum AgentFrame {
    #[serde(rename = "agent-command:response")]
    CommandResponse { id: String, response: AgentResponse },
    #[serde(rename = "proxy:http:response:start")]
    ResponseStart {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    #[serde(rename = "proxy:http:response:chunk")]
    ResponseChunk { id: String, chunk: String },
    #[serde(rename = "proxy:http:response:end")]
    ResponseEnd { id: String },
    #[serde(rename = "proxy:http:response:error")]
    ResponseError { id: String, message: String },
}

impl AgentFrame {
    pub fn id(&self) -> &str {
        match self {
            AgentFrame::CommandResponse { id, .. }
            | AgentFrame::ResponseStart { id, .. }
            | AgentFrame::ResponseChunk { id, .. }
            | AgentFrame::ResponseEnd { id }
            | AgentFrame::ResponseError { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_frame_serialization() {
        let frame = ServerFrame::Command {
            id: "c1".into(),
            command: AgentCommand::new(AgentCommandType::FsRead)
                .for_workspace("w1")
                .with_options(json!({"path": "src/main.rs"})),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "agent-command");
        assert_eq!(value["id"], "c1");
        assert_eq!(value["command"]["type"], "FS_READ");
        assert_eq!(value["command"]["workspaceId"], "w1");
        assert_eq!(value["command"]["options"]["path"], "src/main.rs");
    }

    #[test]
    fn test_command_without_workspace_omits_field() {
        let command = AgentCommand::new(AgentCommandType::ContainerStatus);
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(json, r#"{"type":"CONTAINER_STATUS"}"#);
    }

    #[test]
    fn test_response_frame_flattens_payload() {
        let raw = r#"{"event":"agent-command:response","id":"c1","response":{"success":true,"content":"hello"}}"#;
        let frame: AgentFrame = serde_json::from_str(raw).unwrap();
        match frame {
            AgentFrame::CommandResponse { id, response } => {
                assert_eq!(id, "c1");
                assert_eq!(response.success, Some(true));
                assert_eq!(response.get("content"), Some(&json!("hello")));
                assert!(response.failure().is_none());
            }
            other => panic!("Expected CommandResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_response_failure_detection() {
        assert_eq!(
            AgentResponse::failed("disk full").failure().as_deref(),
            Some("disk full")
        );
        let bare_false = AgentResponse {
            success: Some(false),
            ..Default::default()
        };
        assert!(bare_false.failure().is_some());
        assert!(AgentResponse::default().failure().is_none());
    }

    #[test]
    fn test_tunnel_frames_deserialize() {
        let start: AgentFrame = serde_json::from_str(
            r#"{"event":"proxy:http:response:start","id":"t1","status":201,"headers":[["content-type","text/plain"]]}"#,
        )
        .unwrap();
        assert_eq!(start.id(), "t1");
        assert!(matches!(start, AgentFrame::ResponseStart { status: 201, .. }));

        let end: AgentFrame =
            serde_json::from_str(r#"{"event":"proxy:http:response:end","id":"t1"}"#).unwrap();
        assert_eq!(end, AgentFrame::ResponseEnd { id: "t1".into() });
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<AgentFrame, _> =
            serde_json::from_str(r#"{"event":"agent-hello","id":"x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_command_type_display_matches_wire_name() {
        for kind in [
            AgentCommandType::FsMkdir,
            AgentCommandType::ContainerRestart,
            AgentCommandType::Exec,
        ] {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, json!(kind.to_string()));
        }
    }

    #[test]
    fn test_ok_wraps_scalar_payload() {
        let response = AgentResponse::ok(json!(42));
        assert_eq!(response.get("result"), Some(&json!(42)));
    }
}
