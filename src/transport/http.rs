//! HTTP transport: one JSON-RPC exchange per POST
//!
//! Plain requests get a JSON body back (HTTP 200 even for protocol errors).
//! Clients sending `Accept: text/event-stream` get a streamed response instead:
//! the request is registered as a short-lived connection so progress and other
//! server pushes can reach it, and the stream ends after the final response.

use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::{
    auth::{self, AuthConfig},
    logging,
    protocol::{codec, types::ServerInfo, RpcError, SUPPORTED_PROTOCOL_VERSIONS},
    server::Dispatch,
    transport::{
        deliver, dispatch_payload, rpc_error_value, unicast, Capability, CapabilitySet,
        Connection, ConnectionId, ConnectionPool, Outbound, Transport, TransportError,
        TransportKind,
    },
};

const CAPABILITIES: CapabilitySet =
    CapabilitySet::of(&[Capability::Broadcast, Capability::Unicast, Capability::Events]);

pub(crate) type StreamSender = mpsc::UnboundedSender<Outbound>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResponse {
    pub name: String,
    pub version: String,
    pub transport: TransportKind,
    pub protocol_versions: &'static [&'static str],
    pub endpoints: BTreeMap<&'static str, String>,
}

impl DiscoveryResponse {
    pub(crate) fn new(
        info: &ServerInfo,
        transport: TransportKind,
        endpoints: impl IntoIterator<Item = (&'static str, String)>,
    ) -> Self {
        Self {
            name: info.name.clone(),
            version: info.version.clone(),
            transport,
            protocol_versions: SUPPORTED_PROTOCOL_VERSIONS,
            endpoints: endpoints.into_iter().collect(),
        }
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Unauthenticated health and discovery routes shared by the network
/// transports.
pub(crate) fn public_routes(discovery: DiscoveryResponse) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/.well-known/mcp",
            get(move || async move { Json(discovery) }),
        )
}

/// Outer layers shared by the network transports: permissive CORS (answers
/// preflight requests) and the request summary log.
pub(crate) fn with_common_layers(router: Router) -> Router {
    router
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(logging::request_logging_middleware))
}

/// String payloads are sent verbatim, anything else as compact JSON.
pub(crate) fn sse_event(frame: Outbound) -> Event {
    match frame {
        Outbound::Message(text) => Event::default().event("message").data(text),
        Outbound::Event { event, data } => {
            let data = match data {
                Value::String(text) => text,
                other => other.to_string(),
            };
            Event::default().event(event).data(data)
        }
    }
}

pub(crate) fn sse_stream(
    receiver: mpsc::UnboundedReceiver<Outbound>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    UnboundedReceiverStream::new(receiver).map(|frame| Ok(sse_event(frame)))
}

pub struct HttpTransport {
    addr: SocketAddr,
    path: String,
    auth: Arc<AuthConfig>,
    request_timeout: Option<Duration>,
    connections: ConnectionPool<StreamSender>,
}

#[derive(Clone)]
struct HttpState {
    transport: Arc<HttpTransport>,
    server: Arc<dyn Dispatch>,
}

impl HttpTransport {
    pub fn new(addr: SocketAddr, path: impl Into<String>) -> Self {
        Self {
            addr,
            path: path.into(),
            auth: Arc::new(AuthConfig::disabled()),
            request_timeout: None,
            connections: ConnectionPool::new(),
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

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open streaming requests.
    pub fn connections(&self) -> &ConnectionPool<StreamSender> {
        &self.connections
    }

    pub fn router(self: &Arc<Self>, server: Arc<dyn Dispatch>) -> Router {
        let transport: Arc<dyn Transport> = self.clone();
        server.attach_transport(Arc::downgrade(&transport));

        let discovery = DiscoveryResponse::new(
            server.info(),
            TransportKind::Http,
            [("mcp", self.path.clone())],
        );
        let state = HttpState {
            transport: self.clone(),
            server,
        };

        let protected = Router::new()
            .route(&self.path, post(mcp_endpoint))
            .route_layer(middleware::from_fn_with_state(
                self.auth.clone(),
                auth::require_bearer_token,
            ))
            .with_state(state);

        with_common_layers(public_routes(discovery).merge(protected))
    }

    async fn handle_payload(
        self: &Arc<Self>,
        server: &Arc<dyn Dispatch>,
        payload: Value,
        connection: Option<ConnectionId>,
    ) -> Option<Value> {
        let transport: Arc<dyn Transport> = self.clone();
        dispatch_payload(server, &transport, payload, connection, self.request_timeout).await
    }

    fn stream_response(self: &Arc<Self>, server: Arc<dyn Dispatch>, payload: Value) -> Response {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = self
            .connections
            .add(Connection::new(sender.clone(), true));
        debug!(connection_id = %connection, "streaming request opened");

        let transport = self.clone();
        tokio::spawn(async move {
            let reply = transport
                .handle_payload(&server, payload, Some(connection))
                .await;
            transport.connections.remove(connection);
            let frames = match reply {
                Some(Value::Array(responses)) => responses,
                Some(response) => vec![response],
                None => Vec::new(),
            };
            for frame in frames {
                if sender.send(Outbound::Message(frame.to_string())).is_err() {
                    debug!(connection_id = %connection, "stream client went away");
                    break;
                }
            }
        });

        Sse::new(sse_stream(receiver)).into_response()
    }
}

fn wants_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|accept| accept.contains("text/event-stream"))
}

async fn mcp_endpoint(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return (
                StatusCode::OK,
                Json(rpc_error_value(RpcError::parse_error(err.to_string()))),
            )
                .into_response()
        }
    };

    if wants_stream(&headers) {
        return state.transport.stream_response(state.server, payload);
    }

    match state
        .transport
        .handle_payload(&state.server, payload, None)
        .await
    {
        Some(response) => (StatusCode::OK, Json(response)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
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
        // no event framing in this stream; events travel as notifications
        let frame = Outbound::Message(codec::notification_value(event, data.clone()).to_string());
        deliver(&self.connections, frame, target)
    }

    async fn serve(self: Arc<Self>, server: Arc<dyn Dispatch>) -> Result<(), TransportError> {
        let app = self.router(server);
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.addr,
                source,
            })?;
        info!(addr = %self.addr, path = %self.path, "http transport listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        protocol::types::{CallToolResult, Tool},
        server::{McpServer, ToolHandler},
    };

    fn server() -> Arc<McpServer> {
        let server = McpServer::new("http-test", "0.1.0");
        server.register_tool(
            Tool::new("echo"),
            ToolHandler::contextual(|ctx, arguments| {
                ctx.report_progress("echoing", 0.5);
                let text = arguments
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Ok(CallToolResult::text(format!("Echo: {text}")))
            }),
        );
        Arc::new(server)
    }

    fn app_with(auth: AuthConfig) -> Router {
        let transport = Arc::new(
            HttpTransport::new(SocketAddr::from(([127, 0, 0, 1], 0)), "/mcp").with_auth(auth),
        );
        transport.router(server())
    }

    fn app() -> Router {
        app_with(AuthConfig::disabled())
    }

    fn post_json(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn initialize() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
        })
    }

    #[tokio::test]
    async fn health_is_public() {
        let response = app_with(AuthConfig::static_token("s3cret"))
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn discovery_lists_endpoint() {
        let response = app()
            .oneshot(
                Request::builder()
                    .uri("/.well-known/mcp")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        let body = json_body(response).await;
        assert_eq!(body["name"], "http-test");
        assert_eq!(body["transport"], "http");
        assert_eq!(body["endpoints"]["mcp"], "/mcp");
    }

    #[tokio::test]
    async fn mcp_requires_bearer_token_when_enabled() {
        let response = app_with(AuthConfig::static_token("s3cret"))
            .oneshot(post_json(initialize()))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "missing_token");
    }

    #[tokio::test]
    async fn plaintext_is_forbidden_when_tls_required() {
        let auth = AuthConfig::static_token("s3cret").require_secure_transport(true);
        let mut request = post_json(initialize());
        request.headers_mut().insert(
            header::AUTHORIZATION,
            "Bearer s3cret".parse().expect("header"),
        );

        let response = app_with(auth).oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn spoofed_forwarded_proto_is_forbidden_by_default() {
        let auth = AuthConfig::static_token("s3cret").require_secure_transport(true);
        let mut request = post_json(initialize());
        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().expect("header"));
        headers.insert("x-forwarded-proto", "https".parse().expect("header"));

        let response = app_with(auth).oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "insecure_transport");
    }

    #[tokio::test]
    async fn trusted_forwarded_https_satisfies_tls_requirement() {
        let auth = AuthConfig::static_token("s3cret")
            .require_secure_transport(true)
            .trust_forwarded_proto(true);
        let mut request = post_json(initialize());
        let headers = request.headers_mut();
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().expect("header"));
        headers.insert("x-forwarded-proto", "https".parse().expect("header"));

        let response = app_with(auth).oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn preflight_is_answered_without_a_token() {
        let response = app_with(AuthConfig::static_token("s3cret"))
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/mcp")
                    .header(header::ORIGIN, "https://client.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(
                        header::ACCESS_CONTROL_REQUEST_HEADERS,
                        "authorization, content-type",
                    )
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_HEADERS));
    }

    #[tokio::test]
    async fn parse_error_is_http_ok_with_rpc_error() {
        let response = app()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp")
                    .body(Body::from("{broken"))
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert!(body["id"].is_null());
    }

    #[tokio::test]
    async fn notification_only_gets_no_content() {
        let response = app()
            .oneshot(post_json(json!({"jsonrpc": "2.0", "method": "initialized"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn batch_answers_requests_in_order() {
        let batch = json!([
            initialize(),
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 2, "method": "ping"}
        ]);

        let response = app().oneshot(post_json(batch)).await.expect("response");

        let body = json_body(response).await;
        let replies = body.as_array().expect("batch reply");
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[1]["id"], 2);
        assert_eq!(replies[1]["result"], json!({}));
    }

    #[tokio::test]
    async fn empty_batch_is_invalid_request() {
        let response = app().oneshot(post_json(json!([]))).await.expect("response");

        assert_eq!(json_body(response).await["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn streaming_mode_carries_progress_then_result() {
        let transport = Arc::new(HttpTransport::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            "/mcp",
        ));
        let app = transport.router(server());
        app.clone()
            .oneshot(post_json(initialize()))
            .await
            .expect("initialize");

        let mut request = post_json(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": {"name": "echo", "arguments": {"text": "hi"}, "_meta": {"progressToken": "p"}}
        }));
        request.headers_mut().insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().expect("header"),
        );
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("stream body")
            .to_bytes();
        let text = String::from_utf8(bytes.to_vec()).expect("utf8");
        let frames: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .map(|data| serde_json::from_str(data).expect("frame json"))
            .collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["method"], "notifications/progress");
        assert_eq!(frames[1]["result"]["content"][0]["text"], "Echo: hi");
        assert!(transport.connections().is_empty());
    }
}
