//! Filesystem operations on a workspace's mounted project directory.
//!
//! The same [`FsOperation`] is either executed inside an engine-hosted
//! container or sent to the owner's agent as an `FS_*` command, so the
//! conversion to [`AgentCommand`] lives here next to the type.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::protocol::{AgentCommand, AgentCommandType, AgentResponse};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FsOperation {
    Tree {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        depth: Option<u32>,
    },
    Read {
        path: String,
    },
    Write {
        path: String,
        content: String,
    },
    Delete {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Mkdir {
        path: String,
    },
}

impl FsOperation {
    pub fn command_type(&self) -> AgentCommandType {
        match self {
            FsOperation::Tree { .. } => AgentCommandType::FsTree,
            FsOperation::Read { .. } => AgentCommandType::FsRead,
            FsOperation::Write { .. } => AgentCommandType::FsWrite,
            FsOperation::Delete { .. } => AgentCommandType::FsDelete,
            FsOperation::Rename { .. } => AgentCommandType::FsRename,
            FsOperation::Mkdir { .. } => AgentCommandType::FsMkdir,
        }
    }

    /// Every path this operation touches, for confinement checks.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            FsOperation::Tree { path, .. } => path.as_deref().into_iter().collect(),
            FsOperation::Read { path }
            | FsOperation::Write { path, .. }
            | FsOperation::Delete { path }
            | FsOperation::Mkdir { path } => vec![path.as_str()],
            FsOperation::Rename { from, to } => vec![from.as_str(), to.as_str()],
        }
    }

    pub fn to_command(&self, workspace_id: &str) -> AgentCommand {
        let options = match self {
            FsOperation::Tree { path, depth } => json!({"path": path, "depth": depth}),
            FsOperation::Read { path } => json!({"path": path}),
            FsOperation::Write { path, content } => json!({"path": path, "content": content}),
            FsOperation::Delete { path } => json!({"path": path}),
            FsOperation::Rename { from, to } => json!({"from": from, "to": to}),
            FsOperation::Mkdir { path } => json!({"path": path}),
        };
        AgentCommand::new(self.command_type())
            .for_workspace(workspace_id)
            .with_options(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsEntryKind {
    File,
    Dir,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEntry {
    pub path: String,
    pub kind: FsEntryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FsOutcome {
    Tree { entries: Vec<FsEntry> },
    Content { content: String },
    Done,
}

impl FsOutcome {
    /// Interpret an agent reply for the operation that produced it.
    pub fn from_agent(op: &FsOperation, response: &AgentResponse) -> Self {
        match op {
            FsOperation::Tree { .. } => {
                let entries = response
                    .get("tree")
                    .or_else(|| response.get("entries"))
                    .cloned()
                    .and_then(|v| serde_json::from_value::<Vec<FsEntry>>(v).ok())
                    .unwrap_or_default();
                FsOutcome::Tree { entries }
            }
            FsOperation::Read { .. } => FsOutcome::Content {
                content: response
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            _ => FsOutcome::Done,
        }
    }
}

/// Validate a caller-supplied path and return it relative to the project root.
///
/// Absolute paths are re-rooted; `.` segments are dropped; any `..` segment
/// is rejected so operations cannot escape the workspace mount.
pub fn confine_path(path: &str) -> Result<String, String> {
    let mut parts = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(format!("Path '{}' escapes the workspace", path)),
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}
