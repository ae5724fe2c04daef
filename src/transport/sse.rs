//! Server-Sent Events transport
//!
//! A client opens `GET <sse path>` and keeps it open; the first event on the
//! stream is `endpoint`, whose data is the URL to POST messages to, including
//! an unguessable session id. Every reply, notification and event for that session comes
//! back over the stream. The POST side only acknowledges with 202.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    middleware,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::{self, AuthConfig},
    errors::AppError,
    protocol::RpcError,
    server::Dispatch,
    transport::{
        deliver, dispatch_payload, event_frame,
        http::{public_routes, sse_stream, with_common_layers, DiscoveryResponse, StreamSender},
        rpc_error_value, unicast, Capability, CapabilitySet, Connection, ConnectionId,
        ConnectionPool, Outbound, Transport, TransportError, TransportKind,
    },
};

const CAPABILITIES: CapabilitySet =
    CapabilitySet::of(&[Capability::Broadcast, Capability::Unicast, Capability::Events]);

pub const ENDPOINT_EVENT: &str = "endpoint";

pub struct SseTransport {
    addr: SocketAddr,
    sse_path: String,
    message_path: String,
    auth: Arc<AuthConfig>,
    request_timeout: Option<Duration>,
    connections: ConnectionPool<StreamSender>,
    sessions: Mutex<HashMap<Uuid, ConnectionId>>,
}

#[derive(Clone)]
struct SseState {
    transport: Arc<SseTransport>,
    server: Arc<dyn Dispatch>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Uuid,
}

/// Drops the session from the pool once the event stream is gone.
struct StreamGuard {
    transport: Arc<SseTransport>,
    session: Uuid,
    connection: ConnectionId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.transport.sessions.lock().remove(&self.session);
        self.transport.connections.remove(self.connection);
        info!(connection_id = %self.connection, "sse stream closed");
    }
}

impl SseTransport {
    pub fn new(
        addr: SocketAddr,
        sse_path: impl Into<String>,
        message_path: impl Into<String>,
    ) -> Self {
        Self {
            addr,
            sse_path: sse_path.into(),
            message_path: message_path.into(),
            auth: Arc::new(AuthConfig::disabled()),
            request_timeout: None,
            connections: ConnectionPool::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn connections(&self) -> &ConnectionPool<StreamSender> {
        &self.connections
    }

    fn endpoint_for(&self, session: Uuid) -> String {
        format!("{}?sessionId={}", self.message_path, session)
    }

    fn session_connection(&self, session: &Uuid) -> Option<ConnectionId> {
        let connection = *self.sessions.lock().get(session)?;
        self.connections.get(connection).map(|_| connection)
    }

    pub fn router(self: &Arc<Self>, server: Arc<dyn Dispatch>) -> Router {
        let transport: Arc<dyn Transport> = self.clone();
        server.attach_transport(Arc::downgrade(&transport));

        let discovery = DiscoveryResponse::new(
            server.info(),
            TransportKind::Sse,
            [
                ("sse", self.sse_path.clone()),
                ("message", self.message_path.clone()),
            ],
        );
        let state = SseState {
            transport: self.clone(),
            server,
        };

        let protected = Router::new()
            .route(&self.sse_path, get(open_stream))
            .route(&self.message_path, post(post_message))
            .route_layer(middleware::from_fn_with_state(
                self.auth.clone(),
                auth::require_bearer_token,
            ))
            .with_state(state);

        with_common_layers(public_routes(discovery).merge(protected))
    }

    fn open(self: &Arc<Self>) -> Response {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = self
            .connections
            .add(Connection::new(sender.clone(), self.auth.is_enabled()));
        let session = Uuid::new_v4();
        self.sessions.lock().insert(session, connection);
        info!(connection_id = %connection, "sse stream opened");

        let endpoint = Value::String(self.endpoint_for(session));
        // the receiver is still held below, so this send cannot fail
        let _ = sender.send(event_frame(ENDPOINT_EVENT, &endpoint));

        let guard = StreamGuard {
            transport: self.clone(),
            session,
            connection,
        };
        let stream = sse_stream(receiver).map(move |event| {
            let _ = &guard;
            event
        });

        Sse::new(stream)
            .keep_alive(KeepAlive::default())
            .into_response()
    }

    async fn accept(
        self: &Arc<Self>,
        server: Arc<dyn Dispatch>,
        connection: ConnectionId,
        body: Bytes,
    ) {
        let payload: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => {
                let error = rpc_error_value(RpcError::parse_error(err.to_string()));
                self.push(connection, error);
                return;
            }
        };

        let inline = match &payload {
            Value::Object(fields) => {
                !fields.contains_key("id")
                    || fields.get("method").and_then(Value::as_str) == Some("initialize")
            }
            _ => true,
        };

        let transport = self.clone();
        let task = async move {
            let dyn_transport: Arc<dyn Transport> = transport.clone();
            let reply = dispatch_payload(
                &server,
                &dyn_transport,
                payload,
                Some(connection),
                transport.request_timeout,
            )
            .await;
            if let Some(reply) = reply {
                transport.push(connection, reply);
            }
        };

        if inline {
            task.await;
        } else {
            tokio::spawn(task);
        }
    }

    fn push(&self, connection: ConnectionId, message: Value) {
        if !self
            .connections
            .deliver_to(connection, Outbound::Message(message.to_string()))
        {
            debug!(connection_id = %connection, "reply dropped, stream closed");
        }
    }
}

async fn open_stream(State(state): State<SseState>) -> Response {
    state.transport.open()
}

async fn post_message(
    State(state): State<SseState>,
    query: Result<Query<SessionQuery>, QueryRejection>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let Query(query) =
        query.map_err(|err| AppError::bad_request("invalid_session", err.body_text()))?;
    let connection = state
        .transport
        .session_connection(&query.session_id)
        .ok_or_else(|| {
            AppError::not_found(
                "unknown_session",
                format!("no open event stream for session {}", query.session_id),
            )
        })?;

    state
        .transport
        .accept(state.server.clone(), connection, body)
        .await;
    Ok(StatusCode::ACCEPTED)
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn capabilities(&self) -> CapabilitySet {
        CAPABILITIES
    }

    fn broadcast_message(&self, message: &Value) -> usize {
        self.connections
            .deliver_all(&Outbound::Message(message.to_string()))
    }

    fn send_to(&self, connection: ConnectionId, message: &Value) -> Result<(), TransportError> {
        unicast(
            &self.connections,
            connection,
            Outbound::Message(message.to_string()),
        )
    }

    fn send_event(
        &self,
        event: &str,
        data: &Value,
        target: Option<ConnectionId>,
    ) -> Result<usize, TransportError> {
        deliver(&self.connections, event_frame(event, data), target)
    }

    async fn serve(self: Arc<Self>, server: Arc<dyn Dispatch>) -> Result<(), TransportError> {
        let app = self.router(server);
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.addr,
                source,
            })?;
        info!(
            addr = %self.addr,
            sse_path = %self.sse_path,
            message_path = %self.message_path,
            "sse transport listening"
        );
        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request},
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        protocol::types::{CallToolResult, Tool},
        server::{McpServer, ToolHandler},
    };

    fn app() -> (Arc<SseTransport>, Router) {
        let server = Arc::new(McpServer::new("sse-test", "0.1.0"));
        server.register_tool(
            Tool::new("echo"),
            ToolHandler::plain(|arguments| {
                let text = arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(CallToolResult::text(format!("Echo: {text}")))
            }),
        );
        let transport = Arc::new(SseTransport::new(
            "127.0.0.1:0".parse().expect("socket addr"),
            "/sse",
            "/message",
        ));
        let router = transport.router(server);
        (transport, router)
    }

    /// Reads the next SSE frame that carries an event, skipping keep-alives.
    async fn next_event(body: &mut Body) -> (String, String) {
        loop {
            let frame = body
                .frame()
                .await
                .expect("stream still open")
                .expect("frame");
            let Ok(data) = frame.into_data() else {
                continue;
            };
            let text = String::from_utf8(data.to_vec()).expect("utf8 frame");
            let mut event = String::new();
            let mut payload = String::new();
            for line in text.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim_start().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    payload = value.trim_start().to_string();
                }
            }
            if !event.is_empty() {
                return (event, payload);
            }
        }
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn stream_announces_endpoint_and_carries_replies() {
        let (transport, router) = app();

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/sse")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("sse response");
        assert_eq!(response.status(), StatusCode::OK);
        let mut body = response.into_body();

        let (event, endpoint) = next_event(&mut body).await;
        assert_eq!(event, "endpoint");
        assert!(endpoint.starts_with("/message?sessionId="));
        assert_eq!(transport.connections().len(), 1);

        let accepted = router
            .clone()
            .oneshot(post(
                &endpoint,
                json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "initialize",
                    "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
                }),
            ))
            .await
            .expect("post response");
        assert_eq!(accepted.status(), StatusCode::ACCEPTED);

        let (event, data) = next_event(&mut body).await;
        assert_eq!(event, "message");
        let reply: Value = serde_json::from_str(&data).expect("json reply");
        assert_eq!(reply["result"]["protocolVersion"], "2025-03-26");

        router
            .clone()
            .oneshot(post(
                &endpoint,
                json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "tools/call",
                    "params": {"name": "echo", "arguments": {"text": "sse"}}
                }),
            ))
            .await
            .expect("post response");
        let (_, data) = next_event(&mut body).await;
        let reply: Value = serde_json::from_str(&data).expect("json reply");
        assert_eq!(reply["id"], 2);
        assert_eq!(reply["result"]["content"][0]["text"], "Echo: sse");

        drop(body);
        assert!(transport.connections().is_empty());
    }

    #[tokio::test]
    async fn custom_events_use_their_own_event_type() {
        let (transport, router) = app();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sse")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("sse response");
        let mut body = response.into_body();
        next_event(&mut body).await;

        let reached = transport
            .send_event("build", &json!({"step": 3}), None)
            .expect("event delivered");
        assert_eq!(reached, 1);

        let (event, data) = next_event(&mut body).await;
        assert_eq!(event, "build");
        assert_eq!(data, r#"{"step":3}"#);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (_, router) = app();

        let response = router
            .oneshot(post(
                &format!("/message?sessionId={}", Uuid::new_v4()),
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("post response");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["code"], "unknown_session");
    }

    #[tokio::test]
    async fn sessions_cannot_be_addressed_by_connection_number() {
        let (transport, router) = app();
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/sse")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("sse response");
        let mut body = response.into_body();
        let (_, endpoint) = next_event(&mut body).await;
        let connection = transport.connections().ids()[0];

        let session = endpoint
            .strip_prefix("/message?sessionId=")
            .expect("endpoint carries the session");
        assert!(Uuid::parse_str(session).is_ok());
        assert_ne!(session, connection.to_string());

        let guessed = router
            .clone()
            .oneshot(post(
                &format!("/message?sessionId={connection}"),
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("post response");
        assert_eq!(guessed.status(), StatusCode::BAD_REQUEST);

        let made_up = router
            .oneshot(post(
                &format!("/message?sessionId={}", Uuid::new_v4()),
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("post response");
        assert_eq!(made_up.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_session_id_is_a_bad_request() {
        let (_, router) = app();

        let response = router
            .oneshot(post(
                "/message",
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            ))
            .await
            .expect("post response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn message_endpoint_answers_preflight() {
        let (_, router) = app();

        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/message")
                    .header(header::ORIGIN, "https://client.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("preflight response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn stream_requires_token_when_auth_is_enabled() {
        let server = Arc::new(McpServer::new("sse-test", "0.1.0"));
        let transport = Arc::new(
            SseTransport::new("127.0.0.1:0".parse().expect("socket addr"), "/sse", "/message")
                .with_auth(AuthConfig::static_token("s3cret")),
        );
        let router = transport.router(server);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sse")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("sse response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(transport.connections().is_empty());
    }
}
