//! Mounts the reverse proxy under `/<prefix>/`.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use berth_runtime::proxy::split_path;

use super::SharedState;
use super::api::authorize;
use super::auth::Caller;

pub async fn proxy_handler(State(state): State<SharedState>, req: Request) -> Response {
    let caller = Caller::from_headers(req.headers());
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let Some((workspace_id, _)) = split_path(state.proxy.prefix(), path_and_query) else {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };
    if let Err(e) = authorize(&state, &caller, &workspace_id) {
        return e.into_response();
    }
    state.proxy.handle(req).await.map(Body::new)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Request;
    use berth_runtime::MountKind;
    use berth_runtime::testing::{CountingProbe, FakeEngine};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::BerthConfig;
    use crate::server::{AppState, build_router};

    fn app(engine: Arc<FakeEngine>) -> axum::Router {
        let config = BerthConfig::default();
        let state = AppState::new(&config, engine, Arc::new(CountingProbe::healthy())).unwrap();
        build_router(Arc::new(state))
    }

    #[tokio::test]
    async fn test_proxy_route_unknown_workspace_is_404() {
        let app = app(Arc::new(FakeEngine::new()));
        let req = Request::builder().uri("/ws/ghost/").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_route_dead_upstream_is_502() {
        let engine = Arc::new(FakeEngine::new());
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        engine.set_host_port(port);
        engine.seed_container("berth-ws-w1", "img", MountKind::Volume, true);
        let app = app(engine);
        let req = Request::builder().uri("/ws/w1").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_proxy_route_forwards() {
        let upstream = axum::Router::new().fallback(|uri: axum::http::Uri| async move {
            format!("upstream saw {uri}")
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, upstream).await.unwrap();
        });

        let engine = Arc::new(FakeEngine::new());
        engine.set_host_port(port);
        engine.seed_container("berth-ws-w1", "img", MountKind::Volume, true);
        let app = app(engine);
        let req = Request::builder()
            .uri("/ws/w1/static/main.js?v=2")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"upstream saw /static/main.js?v=2");
    }
}
