//! Workspace runtime for berth.
//!
//! Owns everything that touches a running workspace: the container engine,
//! the per-user agent relay, hosting resolution, terminal sessions and the
//! reverse proxy. The HTTP surface lives in the `berth` binary crate.

pub mod correlator;
pub mod docker;
pub mod engine;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod paths;
pub mod proxy;
pub mod records;
pub mod relay;
pub mod repo;
pub mod resolver;
pub mod settings;
pub mod single_flight;
pub mod terminal;
pub mod tunnel;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use docker::DockerEngine;
pub use engine::{ContainerEngine, ContainerInfo, ContainerSpec, ExecOutput, MountKind, MountSpec};
pub use error::{EngineError, ProvisioningError, ProxyUnavailable, Result, RuntimeError};
pub use health::{HealthPolicy, HealthProbe, HttpHealthProbe};
pub use lifecycle::{ContainerLifecycleManager, LifecycleConfig, LifecycleState};
pub use paths::EnginePathStyle;
pub use proxy::{ProxyConfig, ProxyRouter};
pub use records::{ContainerRecordStore, MemoryRecordStore};
pub use relay::{AgentRegistry, AgentRelay};
pub use resolver::{AgentLifecycle, HostingResolver, Route, WorkspaceLifecycle};
pub use terminal::{TerminalConfig, TerminalEvent, TerminalMultiplexer};
