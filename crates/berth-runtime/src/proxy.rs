//! Reverse Proxy Router.
//!
//! `/<prefix>/<workspace_id>/<rest>` is forwarded to the workspace
//! container's published port, looked up fresh from the engine on every
//! request. LOCAL workspaces whose owner has a live agent are served through
//! the agent's HTTP tunnel instead.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth_common::{HostingType, TunnelRequest, WorkspaceStore};
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::engine::ContainerEngine;
use crate::error::{ProxyUnavailable, Result, RuntimeError};
use crate::lifecycle::container_name;
use crate::relay::AgentRelay;
use crate::tunnel::TunnelResponse;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub prefix: String,
    pub upstream_host: String,
    /// Container port whose host mapping is the upstream.
    pub internal_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            prefix: "ws".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            internal_port: 8080,
        }
    }
}

/// Split `/<prefix>/<id>/<rest>?<query>` into the workspace id and the
/// upstream path. An empty rest becomes `/`; the query is kept.
pub fn split_path(prefix: &str, path_and_query: &str) -> Option<(String, String)> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let rest = path
        .strip_prefix('/')?
        .strip_prefix(prefix.trim_matches('/'))?
        .strip_prefix('/')?;
    let (id, tail) = rest.split_once('/').unwrap_or((rest, ""));
    if id.is_empty() {
        return None;
    }
    let mut upstream = format!("/{tail}");
    if let Some(query) = query {
        upstream.push('?');
        upstream.push_str(query);
    }
    Some((id.to_string(), upstream))
}

/// True for an HTTP/1.1 upgrade request (WebSocket and friends).
pub fn is_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && headers.contains_key(header::UPGRADE)
}

const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let message: String = message.into();
    let mut response = Response::new(
        Full::new(Bytes::from(message))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub struct ProxyRouter {
    engine: Arc<dyn ContainerEngine>,
    workspaces: Arc<dyn WorkspaceStore>,
    relay: Arc<AgentRelay>,
    config: ProxyConfig,
    client: Client<HttpConnector, ProxyBody>,
}

impl ProxyRouter {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        workspaces: Arc<dyn WorkspaceStore>,
        relay: Arc<AgentRelay>,
        config: ProxyConfig,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            engine,
            workspaces,
            relay,
            config,
            client,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Host port of the workspace's running container.
    pub async fn resolve_port(&self, workspace_id: &str) -> Result<u16> {
        let info = self
            .engine
            .inspect_container(&container_name(workspace_id))
            .await
            .map_err(|e| RuntimeError::engine("inspect_container", e))?
            .ok_or_else(|| ProxyUnavailable::UnknownWorkspace(workspace_id.to_string()))?;
        if !info.running {
            return Err(ProxyUnavailable::NotRunning(workspace_id.to_string()).into());
        }
        info.host_port(self.config.internal_port)
            .ok_or_else(|| ProxyUnavailable::NoPort(workspace_id.to_string()).into())
    }

    /// Owner of a LOCAL workspace, if their agent is connected.
    async fn tunnel_user(&self, workspace_id: &str) -> Option<String> {
        let ws = self.workspaces.get_workspace(workspace_id).await?;
        if ws.hosting_type != HostingType::Local {
            return None;
        }
        let owner = ws.owner_id?;
        self.relay.is_connected(&owner).then_some(owner)
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let Some((workspace_id, upstream_path)) = split_path(&self.config.prefix, path_and_query)
        else {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        };

        match self.tunnel_user(&workspace_id).await {
            Some(user_id) => {
                self.forward_to_agent(&user_id, &workspace_id, &upstream_path, req)
                    .await
            }
            None => {
                self.forward_to_engine(&workspace_id, &upstream_path, req)
                    .await
            }
        }
    }

    async fn forward_to_engine<B>(
        &self,
        workspace_id: &str,
        upstream_path: &str,
        mut req: Request<B>,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let port = match self.resolve_port(workspace_id).await {
            Ok(port) => port,
            Err(RuntimeError::ProxyUnavailable(reason)) => {
                debug!(workspace_id, %reason, "proxy target unavailable");
                return text_response(StatusCode::NOT_FOUND, reason.to_string());
            }
            Err(e) => {
                warn!(workspace_id, error = %e, "proxy target lookup failed");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        let target = format!("http://{}:{}{}", self.config.upstream_host, port, upstream_path);
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                debug!(workspace_id, error = %e, "unproxyable path");
                return text_response(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let upgrade = is_upgrade(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        if !upgrade {
            strip_hop_by_hop(&mut parts.headers);
        }
        let outbound = Request::from_parts(parts, body.map_err(Into::into).boxed_unsync());

        let mut response = match self.client.request(outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!(workspace_id, port, error = %e, "upstream request failed");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };

        if let Some(client_upgrade) = client_upgrade {
            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let upstream_upgrade = hyper::upgrade::on(&mut response);
                tokio::spawn(splice(
                    workspace_id.to_string(),
                    client_upgrade,
                    upstream_upgrade,
                ));
            }
        }

        response.map(|body| body.map_err(Into::into).boxed_unsync())
    }

    async fn forward_to_agent<B>(
        &self,
        user_id: &str,
        workspace_id: &str,
        upstream_path: &str,
        req: Request<B>,
    ) -> Response<ProxyBody>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if is_upgrade(req.headers()) {
            return text_response(
                StatusCode::BAD_GATEWAY,
                "WebSocket upgrades are not supported through the agent tunnel",
            );
        }

        let (parts, body) = req.into_parts();
        let bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let e: BoxError = e.into();
                warn!(workspace_id, error = %e, "failed to read request body");
                return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
            }
        };
        let headers = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let request = TunnelRequest {
            workspace_id: workspace_id.to_string(),
            method: parts.method.to_string(),
            path: upstream_path.to_string(),
            headers,
            body: (!bytes.is_empty()).then(|| BASE64.encode(&bytes)),
        };

        match self.relay.open_tunnel(user_id, request).await {
            Ok(tunnel) => tunnel_response(tunnel),
            Err(e) => {
                warn!(workspace_id, user_id, error = %e, "agent tunnel failed");
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

fn tunnel_response(tunnel: TunnelResponse) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(tunnel.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = StreamBody::new(
        tunnel
            .body
            .map(|chunk| chunk.map(Frame::data).map_err(BoxError::from)),
    );
    let mut response = Response::new(BodyExt::boxed_unsync(body));
    *response.status_mut() = status;
    for (name, value) in tunnel.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => debug!(%name, "dropping invalid tunneled header"),
        }
    }
    strip_hop_by_hop(response.headers_mut());
    response
}

async fn splice(workspace_id: String, client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%workspace_id, error = %e, "upgrade handshake failed");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(%workspace_id, sent, received, "upgraded connection closed"),
        Err(e) => debug!(%workspace_id, error = %e, "upgraded connection ended with error"),
    }
}
