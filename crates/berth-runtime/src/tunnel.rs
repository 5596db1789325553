//! HTTP-over-agent tunnel bookkeeping.
//!
//! An agent answers a tunneled request with `start`, any number of base64
//! `chunk`s, then `end` or `error`. [`PendingTunnel::response`] turns that
//! frame sequence into a status, headers and a streaming body, all bounded
//! by one deadline measured from when the request was sent.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth_common::AgentFrame;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("agent aborted the response: {0}")]
    Aborted(String),

    #[error("tunneled response exceeded its deadline")]
    TimedOut,
}

pub type TunnelBody = BoxStream<'static, Result<Bytes, TunnelError>>;

/// Response assembled from the agent's frames.
pub struct TunnelResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TunnelBody,
}

impl TunnelResponse {
    /// Plain-text response produced locally when the agent never sent headers.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self {
            status,
            headers: vec![("content-type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: futures_util::stream::once(async move { Ok(Bytes::from(message)) }).boxed(),
        }
    }

    /// Collect the whole body. Test and small-response helper.
    pub async fn collect_body(self) -> Result<Vec<u8>, TunnelError> {
        let mut out = Vec::new();
        let mut body = self.body;
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TunnelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Head {
    status: u16,
    headers: Vec<(String, String)>,
}

type HeadResult = Result<Head, String>;
type BodyItem = Result<Bytes, TunnelError>;

#[derive(Debug)]
struct Slot {
    head: Option<oneshot::Sender<HeadResult>>,
    body: mpsc::UnboundedSender<BodyItem>,
}

/// Open tunnels keyed by correlation id.
#[derive(Debug, Clone, Default)]
pub struct TunnelTable {
    slots: Arc<DashMap<String, Slot>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, id: &str) -> PendingTunnel {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        self.slots.insert(
            id.to_string(),
            Slot {
                head: Some(head_tx),
                body: body_tx,
            },
        );
        PendingTunnel {
            head_rx,
            body: Some(BodyState {
                rx: body_rx,
                guard: SlotGuard {
                    id: id.to_string(),
                    slots: Arc::clone(&self.slots),
                },
            }),
        }
    }

    /// Drop a tunnel without waiting for the agent.
    pub fn cancel(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Route a tunnel frame. Returns false for frames with no open tunnel,
    /// and for frames that are not tunnel frames.
    pub fn handle(&self, frame: AgentFrame) -> bool {
        match frame {
            AgentFrame::ResponseStart {
                id,
                status,
                headers,
            } => {
                let Some(mut slot) = self.slots.get_mut(&id) else {
                    return false;
                };
                match slot.head.take() {
                    Some(tx) => {
                        let _ = tx.send(Ok(Head { status, headers }));
                        true
                    }
                    None => {
                        debug!(%id, "duplicate response start ignored");
                        false
                    }
                }
            }
            AgentFrame::ResponseChunk { id, chunk } => {
                let decoded = match BASE64.decode(chunk.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%id, error = %e, "undecodable tunnel chunk; aborting response");
                        return self.fail(&id, format!("invalid body chunk: {e}"));
                    }
                };
                match self.slots.get(&id) {
                    Some(slot) => {
                        let _ = slot.body.send(Ok(Bytes::from(decoded)));
                        true
                    }
                    None => false,
                }
            }
            AgentFrame::ResponseEnd { id } => match self.slots.remove(&id) {
                Some((_, mut slot)) => {
                    if let Some(tx) = slot.head.take() {
                        let _ = tx.send(Err("agent ended the response before headers".into()));
                    }
                    true
                }
                None => false,
            },
            AgentFrame::ResponseError { id, message } => self.fail(&id, message),
            AgentFrame::CommandResponse { .. } => false,
        }
    }

    fn fail(&self, id: &str, message: String) -> bool {
        match self.slots.remove(id) {
            Some((_, mut slot)) => {
                match slot.head.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(message));
                    }
                    None => {
                        let _ = slot.body.send(Err(TunnelError::Aborted(message)));
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Removes its slot when the response (or its body) is dropped.
#[derive(Debug)]
struct SlotGuard {
    id: String,
    slots: Arc<DashMap<String, Slot>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}

#[derive(Debug)]
struct BodyState {
    rx: mpsc::UnboundedReceiver<BodyItem>,
    guard: SlotGuard,
}

#[derive(Debug)]
pub struct PendingTunnel {
    head_rx: oneshot::Receiver<HeadResult>,
    body: Option<BodyState>,
}

impl PendingTunnel {
    /// Wait for headers, then stream the body, all within `timeout`.
    ///
    /// No headers in time gives 504; an agent error before headers gives 502.
    pub async fn response(mut self, timeout: Duration) -> TunnelResponse {
        let deadline = Instant::now() + timeout;
        let head = tokio::time::timeout_at(deadline, &mut self.head_rx).await;
        let Some(body) = self.body.take() else {
            return TunnelResponse::error(502, "tunnel already consumed");
        };

        match head {
            Ok(Ok(Ok(head))) => TunnelResponse {
                status: head.status,
                headers: head.headers,
                body: body_stream(body, deadline),
            },
            Ok(Ok(Err(message))) => TunnelResponse::error(502, format!("Bad Gateway: {message}")),
            Ok(Err(_)) => TunnelResponse::error(502, "Bad Gateway: tunnel closed"),
            Err(_) => TunnelResponse::error(504, "Gateway Timeout"),
        }
    }
}

fn body_stream(state: BodyState, deadline: Instant) -> TunnelBody {
    futures_util::stream::unfold(Some(state), move |state| async move {
        let mut state = state?;
        match tokio::time::timeout_at(deadline, state.rx.recv()).await {
            Ok(Some(Ok(bytes))) => Some((Ok(bytes), Some(state))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => {
                debug!(id = %state.guard.id, "tunnel body deadline passed; closing");
                Some((Err(TunnelError::TimedOut), None))
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, data: &[u8]) -> AgentFrame {
        AgentFrame::ResponseChunk {
            id: id.into(),
            chunk: BASE64.encode(data),
        }
    }

    #[tokio::test]
    async fn test_frames_assemble_response() {
        let table = TunnelTable::new();
        let pending = table.open("t1");

        assert!(table.handle(AgentFrame::ResponseStart {
            id: "t1".into(),
            status: 201,
            headers: vec![("x-test".into(), "1".into())],
        }));
        assert!(table.handle(chunk("t1", b"hello ")));
        assert!(table.handle(chunk("t1", b"world")));
        assert!(table.handle(AgentFrame::ResponseEnd { id: "t1".into() }));

        let response = pending.response(Duration::from_secs(10)).await;
        assert_eq!(response.status, 201);
        assert_eq!(response.headers, vec![("x-test".to_string(), "1".to_string())]);
        assert_eq!(response.collect_body().await.unwrap(), b"hello world");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_error_before_headers_is_bad_gateway() {
        let table = TunnelTable::new();
        let pending = table.open("t1");
        assert!(table.handle(AgentFrame::ResponseError {
            id: "t1".into(),
            message: "connection refused".into(),
        }));
        let response = pending.response(Duration::from_secs(10)).await;
        assert_eq!(response.status, 502);
        let body = response.collect_body().await.unwrap();
        assert!(String::from_utf8(body).unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_error_after_headers_force_closes_body() {
        let table = TunnelTable::new();
        let pending = table.open("t1");
        table.handle(AgentFrame::ResponseStart {
            id: "t1".into(),
            status: 200,
            headers: vec![],
        });
        table.handle(chunk("t1", b"partial"));
        table.handle(AgentFrame::ResponseError {
            id: "t1".into(),
            message: "upstream reset".into(),
        });

        let response = pending.response(Duration::from_secs(10)).await;
        assert_eq!(response.status, 200);
        let mut body = response.body;
        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        assert!(matches!(body.next().await, Some(Err(TunnelError::Aborted(_)))));
        assert!(body.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_headers_in_time_is_gateway_timeout() {
        let table = TunnelTable::new();
        let pending = table.open("t1");
        let response = pending.response(Duration::from_secs(10)).await;
        assert_eq!(response.status, 504);
        // The slot went with the pending tunnel; late frames are ignored.
        assert!(!table.handle(AgentFrame::ResponseEnd { id: "t1".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_after_headers_closes_body() {
        let table = TunnelTable::new();
        let pending = table.open("t1");
        table.handle(AgentFrame::ResponseStart {
            id: "t1".into(),
            status: 200,
            headers: vec![],
        });
        let response = pending.response(Duration::from_secs(10)).await;
        assert_eq!(response.status, 200);
        let result = response.collect_body().await;
        assert_eq!(result, Err(TunnelError::TimedOut));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_and_bad_chunks() {
        let table = TunnelTable::new();
        assert!(!table.handle(chunk("nope", b"x")));
        let pending = table.open("t1");
        table.handle(AgentFrame::ResponseStart {
            id: "t1".into(),
            status: 200,
            headers: vec![],
        });
        assert!(table.handle(AgentFrame::ResponseChunk {
            id: "t1".into(),
            chunk: "%%%not-base64".into(),
        }));
        let result = pending.response(Duration::from_secs(1)).await.collect_body().await;
        assert!(matches!(result, Err(TunnelError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_end_before_start_is_bad_gateway() {
        let table = TunnelTable::new();
        let pending = table.open("t1");
        table.handle(AgentFrame::ResponseEnd { id: "t1".into() });
        assert_eq!(pending.response(Duration::from_secs(1)).await.status, 502);
    }
}
