//! HTTP surface: control API, agent and terminal sockets, reverse proxy.
//!
//! | Module        | Routes                                        |
//! |---------------|-----------------------------------------------|
//! | `api`         | `/health`, `/api/workspaces/*`, `/api/agent/*`|
//! | `agent_ws`    | `GET /agent`                                  |
//! | `terminal_ws` | `GET /terminal/{id}`                          |
//! | `proxy`       | `/<prefix>/{id}/*`                            |

pub mod agent_ws;
pub mod api;
pub mod auth;
pub mod proxy;
pub mod terminal_ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::{any, get}};
use berth_common::{AccessPolicy, AllowAll, MemoryWorkspaceStore};
use berth_runtime::{
    AgentRelay, ContainerEngine, ContainerLifecycleManager, DockerEngine, HealthProbe,
    HostingResolver, HttpHealthProbe, MemoryRecordStore, ProxyRouter, TerminalMultiplexer,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::BerthConfig;

/// How often abandoned commands, locks and rooms are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct AppState {
    pub workspaces: Arc<MemoryWorkspaceStore>,
    pub access: Arc<dyn AccessPolicy>,
    pub lifecycle: Arc<ContainerLifecycleManager>,
    pub relay: Arc<AgentRelay>,
    pub resolver: HostingResolver,
    pub terminals: TerminalMultiplexer,
    pub proxy: ProxyRouter,
    /// SHA-256 hex digest → user id.
    pub agent_tokens: HashMap<String, String>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wire every runtime component against one engine. The workspace store
    /// is seeded from `[[workspaces]]`.
    pub fn new(
        config: &BerthConfig,
        engine: Arc<dyn ContainerEngine>,
        health: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        let workspaces = Arc::new(MemoryWorkspaceStore::with_workspaces(
            config.seed_workspaces(),
        ));
        let relay = Arc::new(AgentRelay::with_timeouts(
            config.command_timeout(),
            config.tunnel_timeout(),
        ));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            engine.clone(),
            workspaces.clone(),
            Arc::new(MemoryRecordStore::new()),
            health,
            config
                .lifecycle_config()
                .context("Invalid [container] configuration")?,
        ));
        let resolver = HostingResolver::new(workspaces.clone(), relay.clone(), lifecycle.clone());
        let terminals = TerminalMultiplexer::new(engine.clone(), config.terminal_config());
        let proxy = ProxyRouter::new(
            engine,
            workspaces.clone(),
            relay.clone(),
            config.proxy_config(),
        );

        Ok(Self {
            workspaces,
            access: Arc::new(AllowAll),
            lifecycle,
            relay,
            resolver,
            terminals,
            proxy,
            agent_tokens: config.agent.tokens.clone(),
        })
    }

    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }
}

pub fn build_router(state: SharedState) -> Router {
    let proxy_route = format!("/{}/{{*rest}}", state.proxy.prefix());
    api::api_router()
        .route("/agent", get(agent_ws::agent_handler))
        .route("/terminal/{id}", get(terminal_ws::terminal_handler))
        .route(&proxy_route, any(proxy::proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn start_server(config: BerthConfig, dev_mode: bool) -> Result<()> {
    let engine = DockerEngine::connect(config.container.engine_endpoint.as_deref())
        .context("Failed to set up container engine client")?;
    if let Err(e) = engine.ping().await {
        warn!(error = %e, "container engine not reachable yet; workspace starts will fail until it is");
    }

    let health = Arc::new(
        HttpHealthProbe::new(config.health.host.clone(), config.health.path.clone())
            .context("Failed to build health probe client")?,
    );
    let state = Arc::new(AppState::new(&config, Arc::new(engine), health)?);

    let sweeper = {
        let state = state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                sweep(&state);
            }
        })
    };

    let mut app = build_router(state);
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, dev_mode, "berth listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    info!("server shut down gracefully");
    Ok(())
}

/// Drop expired agent commands, idle per-workspace locks and terminal rooms
/// nobody listens to.
pub fn sweep(state: &AppState) {
    let swept = state.relay.sweep_expired();
    if swept > 0 {
        info!(swept, "dropped expired agent commands");
    }
    state.lifecycle.prune_locks();
    state.terminals.prune();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use berth_runtime::testing::{CountingProbe, FakeEngine};
    use tower::ServiceExt;

    fn test_router(config: BerthConfig) -> Router {
        let state = AppState::new(
            &config,
            Arc::new(FakeEngine::new()),
            Arc::new(CountingProbe::healthy()),
        )
        .unwrap();
        build_router(Arc::new(state))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router(BerthConfig::default());
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_agent_route_requires_upgrade() {
        let app = test_router(BerthConfig::default());
        let req = Request::builder().uri("/agent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_custom_proxy_prefix_is_mounted() {
        let mut config = BerthConfig::default();
        config.server.proxy_prefix = "code".to_string();
        let app = test_router(config);

        let req = Request::builder().uri("/code/ghost/").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // The default prefix is not routed at all.
        let req = Request::builder().uri("/ws/ghost/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_state_seeds_configured_workspaces() {
        let config = BerthConfig::parse(
            r#"
[[workspaces]]
id = "seeded"
hosting_type = "LOCAL"
"#,
        )
        .unwrap();
        let state = AppState::new(
            &config,
            Arc::new(FakeEngine::new()),
            Arc::new(CountingProbe::healthy()),
        )
        .unwrap();
        let ws = state.resolver.workspace("seeded").await.unwrap();
        assert_eq!(ws.hosting_type, berth_common::HostingType::Local);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_locks_and_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BerthConfig::parse(
            r#"
[[workspaces]]
id = "w1"
hosting_type = "CLOUD"
"#,
        )
        .unwrap();
        config.container.storage_root = dir.path().to_path_buf();
        config.container.settle_delay_ms = 0;
        config.health.interval_ms = 1;
        config.health.max_attempts = 1;
        let state = AppState::new(
            &config,
            Arc::new(FakeEngine::new()),
            Arc::new(CountingProbe::healthy()),
        )
        .unwrap();

        state.resolver.start("w1", None).await.unwrap();
        drop(state.terminals.subscribe("w1"));
        let _listener = state.terminals.subscribe("w2");
        assert_eq!(state.lifecycle.lock_count(), 1);
        assert_eq!(state.terminals.room_count(), 2);

        sweep(&state);
        assert_eq!(state.lifecycle.lock_count(), 0);
        assert_eq!(state.terminals.room_count(), 1);
    }
}
