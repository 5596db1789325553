use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a workspace's container runs.
///
/// `Cloud` containers are owned by the orchestrator's engine and store their
/// files in a named volume. `Local` containers are delegated to the owner's
/// agent when one is connected, and use a bind-mounted host directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostingType {
    #[default]
    Cloud,
    Local,
}

impl HostingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostingType::Cloud => "CLOUD",
            HostingType::Local => "LOCAL",
        }
    }
}

impl std::fmt::Display for HostingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HostingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CLOUD" => Ok(HostingType::Cloud),
            "LOCAL" => Ok(HostingType::Local),
            other => Err(format!(
                "Invalid hosting type '{}'. Valid values: CLOUD, LOCAL",
                other
            )),
        }
    }
}

/// Workspace descriptor as read from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    /// User whose agent serves this workspace when it is hosted locally.
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub hosting_type: HostingType,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub repo_token: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl Workspace {
    pub fn new(id: impl Into<String>, hosting_type: HostingType) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
            hosting_type,
            repo_url: None,
            repo_token: None,
            local_port: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_repo(mut self, repo_url: impl Into<String>, token: Option<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self.repo_token = token;
        self
    }
}

/// Status stored on a [`ContainerRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Provisioning,
    Running,
    Stopped,
}

/// Bookkeeping row tying a workspace to the engine container backing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecord {
    pub workspace_id: String,
    pub engine_container_id: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn provisioning(workspace_id: &str, engine_container_id: &str) -> Self {
        let now = Utc::now();
        Self {
            workspace_id: workspace_id.to_string(),
            engine_container_id: engine_container_id.to_string(),
            status: RecordStatus::Provisioning,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Observed container state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerStatus {
    Offline,
    Stopped,
    Running,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Offline => write!(f, "OFFLINE"),
            ContainerStatus::Stopped => write!(f, "STOPPED"),
            ContainerStatus::Running => write!(f, "RUNNING"),
        }
    }
}

/// Result of a successful start or restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedWorkspace {
    pub workspace_id: String,
    pub port: u16,
}
