//! Shared domain types for the berth orchestrator: workspace and container
//! models, the agent wire protocol, filesystem operations, and the traits
//! the orchestrator uses to reach its external collaborators.

pub mod fs;
pub mod models;
pub mod protocol;
pub mod store;

pub use fs::{FsEntry, FsEntryKind, FsOperation, FsOutcome, confine_path};
pub use models::{
    ContainerRecord, ContainerStatus, HostingType, RecordStatus, StartedWorkspace, Workspace,
};
pub use protocol::{
    AgentCommand, AgentCommandType, AgentFrame, AgentResponse, ServerFrame, TunnelRequest,
};
pub use store::{AccessPolicy, AllowAll, MemoryWorkspaceStore, WorkspaceStore};
