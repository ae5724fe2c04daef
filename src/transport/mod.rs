//! Transport bindings for the Model Context Protocol
//!
//! Every transport binds a [`ConnectionPool`], the protocol codec and a
//! [`Dispatch`] implementation to one concrete I/O surface, and advertises what
//! server-initiated traffic it can carry through a [`CapabilitySet`].

pub mod connection;
pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    protocol::{
        codec::{self, response_value},
        Message, Response, RpcError,
    },
    server::{context::TransportHandle, Dispatch, RequestContext, ServerError},
};

pub use connection::{Connection, ConnectionId, ConnectionPool, Outbound, OutboundChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    WebSocket,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
        };
        f.write_str(name)
    }
}

impl TransportKind {
    /// Whether a connection id names a client session. A streaming HTTP
    /// connection lives for a single POST, so HTTP clients are anonymous.
    pub fn has_sessions(self) -> bool {
        !matches!(self, Self::Http)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Broadcast,
    Events,
    Unicast,
    Bidirectional,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Self::Broadcast => 1,
            Self::Events => 1 << 1,
            Self::Unicast => 1 << 2,
            Self::Bidirectional => 1 << 3,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Broadcast => "broadcast",
            Self::Events => "events",
            Self::Unicast => "unicast",
            Self::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn of(capabilities: &[Capability]) -> Self {
        let mut bits = 0;
        let mut index = 0;
        while index < capabilities.len() {
            bits |= capabilities[index].bit();
            index += 1;
        }
        Self(bits)
    }

    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        [
            Capability::Broadcast,
            Capability::Events,
            Capability::Unicast,
            Capability::Bidirectional,
        ]
        .into_iter()
        .filter(move |capability| self.contains(*capability))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind} transport does not support {capability}")]
    Unsupported {
        kind: TransportKind,
        capability: Capability,
    },
    #[error("transport is no longer running")]
    Closed,
    #[error("request is not bound to a connection")]
    NoConnection,
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
}

/// Where a server-initiated message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The connection the current request arrived on.
    Origin,
    Broadcast,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    fn capabilities(&self) -> CapabilitySet;

    /// Pushes one JSON-RPC document to every live connection.
    fn broadcast_message(&self, message: &Value) -> usize;

    fn send_to(&self, connection: ConnectionId, message: &Value) -> Result<(), TransportError>;

    /// Sends a typed event; `target` of `None` reaches every connection.
    fn send_event(
        &self,
        event: &str,
        data: &Value,
        target: Option<ConnectionId>,
    ) -> Result<usize, TransportError>;

    async fn serve(self: Arc<Self>, server: Arc<dyn Dispatch>) -> Result<(), TransportError>;
}

pub(crate) fn require(
    kind: TransportKind,
    capabilities: CapabilitySet,
    capability: Capability,
) -> Result<(), TransportError> {
    if capabilities.contains(capability) {
        Ok(())
    } else {
        Err(TransportError::Unsupported { kind, capability })
    }
}

pub(crate) fn event_frame(event: &str, data: &Value) -> Outbound {
    Outbound::Event {
        event: event.to_string(),
        data: data.clone(),
    }
}

pub(crate) fn unicast<S: OutboundChannel>(
    pool: &ConnectionPool<S>,
    connection: ConnectionId,
    frame: Outbound,
) -> Result<(), TransportError> {
    if pool.deliver_to(connection, frame) {
        Ok(())
    } else {
        Err(TransportError::ConnectionClosed(connection))
    }
}

/// One connection when `target` is set, otherwise every live connection.
pub(crate) fn deliver<S: OutboundChannel>(
    pool: &ConnectionPool<S>,
    frame: Outbound,
    target: Option<ConnectionId>,
) -> Result<usize, TransportError> {
    match target {
        Some(connection) => unicast(pool, connection, frame).map(|()| 1),
        None => Ok(pool.deliver_all(&frame)),
    }
}

/// Dispatches one decoded message on the blocking thread pool of the async
/// runtime. With a timeout, the caller stops waiting once it elapses and the
/// request's cancellation token is flipped; the handler itself keeps running
/// until it reaches a cancellation checkpoint or completes.
pub(crate) async fn dispatch_blocking(
    server: Arc<dyn Dispatch>,
    message: Message,
    handle: TransportHandle,
    timeout: Option<Duration>,
) -> Option<Response> {
    match message {
        Message::Request(request) => {
            let id = request.id.clone();
            let ctx = RequestContext::for_request(&request, Some(handle));
            let cancellation = ctx.cancellation_token();
            let task = tokio::task::spawn_blocking(move || server.handle_request(request, ctx));

            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        cancellation.cancel();
                        warn!(request_id = %id, timeout_ms = limit.as_millis(), "stopped waiting for request");
                        return Some(Response::failure(
                            Some(id),
                            ServerError::Timeout.to_rpc_error(),
                        ));
                    }
                },
                None => task.await,
            };

            Some(joined.unwrap_or_else(|err| {
                warn!(request_id = %id, error = %err, "dispatch task failed");
                Response::failure(
                    Some(id),
                    ServerError::Internal("dispatch task failed".to_string()).to_rpc_error(),
                )
            }))
        }
        Message::Notification(notification) => {
            let ctx = RequestContext::for_notification(Some(handle));
            let task =
                tokio::task::spawn_blocking(move || server.handle_notification(notification, ctx));
            if let Err(err) = task.await {
                warn!(error = %err, "notification task failed");
            }
            None
        }
        Message::Response(response) => {
            debug!(id = ?response.id, "ignoring client response with no pending server request");
            None
        }
    }
}

pub(crate) fn rpc_error_value(error: RpcError) -> Value {
    response_value(&Response::failure(None, error))
}

/// Decodes and dispatches one JSON value; `None` when nothing is owed.
pub(crate) async fn dispatch_value(
    server: &Arc<dyn Dispatch>,
    transport: &Arc<dyn Transport>,
    payload: Value,
    connection: Option<ConnectionId>,
    timeout: Option<Duration>,
) -> Option<Value> {
    let message = match codec::decode_value(payload) {
        Ok(message) => message,
        Err(err) if err.notification => {
            warn!(error = %err.error, "dropping malformed notification");
            return None;
        }
        Err(err) => return Some(response_value(&err.into_response())),
    };

    let handle = TransportHandle::new(transport, connection);
    dispatch_blocking(server.clone(), message, handle, timeout)
        .await
        .map(|response| response_value(&response))
}

/// Single messages or JSON-RPC batches. Batch members run in order so an
/// `initialize` at the head of a batch is visible to the requests after it.
pub(crate) async fn dispatch_payload(
    server: &Arc<dyn Dispatch>,
    transport: &Arc<dyn Transport>,
    payload: Value,
    connection: Option<ConnectionId>,
    timeout: Option<Duration>,
) -> Option<Value> {
    match payload {
        Value::Array(batch) if batch.is_empty() => {
            Some(rpc_error_value(RpcError::invalid_request("empty batch")))
        }
        Value::Array(batch) => {
            let mut responses = Vec::new();
            for item in batch {
                if let Some(response) =
                    dispatch_value(server, transport, item, connection, timeout).await
                {
                    responses.push(response);
                }
            }
            (!responses.is_empty()).then_some(Value::Array(responses))
        }
        single => dispatch_value(server, transport, single, connection, timeout).await,
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use serde_json::json;

    use super::*;
    use crate::{
        protocol::types::{CallToolResult, Tool},
        server::{McpServer, ToolHandler},
        transport::http::HttpTransport,
    };

    #[test]
    fn capability_set_membership() {
        let set = CapabilitySet::of(&[Capability::Broadcast, Capability::Unicast]);

        assert!(set.contains(Capability::Broadcast));
        assert!(set.contains(Capability::Unicast));
        assert!(!set.contains(Capability::Events));
        assert!(!set.contains(Capability::Bidirectional));
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn require_reports_missing_capability() {
        let error = require(
            TransportKind::Http,
            CapabilitySet::of(&[Capability::Unicast]),
            Capability::Bidirectional,
        )
        .expect_err("http is not bidirectional");

        assert_eq!(
            error.to_string(),
            "http transport does not support bidirectional"
        );
    }

    #[tokio::test]
    async fn slow_request_times_out_and_is_cancelled() {
        let server = McpServer::new("timeout-test", "0.1.0");
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        server.register_tool(
            Tool::new("slow"),
            ToolHandler::contextual(move |ctx, _| {
                thread::sleep(Duration::from_millis(200));
                let _ = seen_tx.send(ctx.cancellation_token().is_cancelled());
                Ok(CallToolResult::text("late"))
            }),
        );
        let server: Arc<dyn Dispatch> = Arc::new(server);
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            "127.0.0.1:0".parse().expect("socket addr"),
            "/mcp",
        ));

        let initialize = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {}}
        });
        dispatch_payload(&server, &transport, initialize, None, None).await;

        let started = Instant::now();
        let reply = dispatch_payload(
            &server,
            &transport,
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "slow"}}),
            None,
            Some(Duration::from_millis(50)),
        )
        .await
        .expect("requests are answered");

        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["error"]["code"], -32001);
        let cancelled = tokio::task::spawn_blocking(move || seen_rx.recv())
            .await
            .expect("join")
            .expect("handler finished");
        assert!(cancelled);
    }

    #[tokio::test]
    async fn notification_only_batch_has_no_reply() {
        let server: Arc<dyn Dispatch> = Arc::new(McpServer::new("batch-test", "0.1.0"));
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            "127.0.0.1:0".parse().expect("socket addr"),
            "/mcp",
        ));

        let reply = dispatch_payload(
            &server,
            &transport,
            json!([
                {"jsonrpc": "2.0", "method": "notifications/initialized"},
                {"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {"requestId": 9}}
            ]),
            None,
            None,
        )
        .await;

        assert!(reply.is_none());
    }
}
