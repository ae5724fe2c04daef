//! WebSocket transport: one persistent connection per socket
//!
//! Each text or binary frame carries one JSON-RPC document. A writer task owns
//! the socket sink and drains the connection's outbound queue, so responses,
//! notifications and broadcasts never interleave inside a frame. `initialize`
//! and notifications are handled before the next frame is read; other requests
//! run concurrently and may complete out of order.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    middleware,
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    auth::{self, AuthConfig},
    protocol::{
        codec::{self, notification_value},
        Message, Response as RpcResponse,
    },
    server::{Dispatch, TransportHandle},
    transport::{
        deliver, dispatch_blocking, event_frame,
        http::{public_routes, with_common_layers, DiscoveryResponse, StreamSender},
        unicast, Capability, CapabilitySet, Connection, ConnectionId, ConnectionPool, Outbound,
        Transport, TransportError, TransportKind,
    },
};

const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::Broadcast,
    Capability::Events,
    Capability::Unicast,
    Capability::Bidirectional,
]);

pub struct WebSocketTransport {
    addr: SocketAddr,
    path: String,
    auth: Arc<AuthConfig>,
    request_timeout: Option<Duration>,
    connections: ConnectionPool<StreamSender>,
}

#[derive(Clone)]
struct WebSocketState {
    transport: Arc<WebSocketTransport>,
    server: Arc<dyn Dispatch>,
}

impl WebSocketTransport {
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

    pub fn connections(&self) -> &ConnectionPool<StreamSender> {
        &self.connections
    }

    pub fn router(self: &Arc<Self>, server: Arc<dyn Dispatch>) -> Router {
        let transport: Arc<dyn Transport> = self.clone();
        server.attach_transport(Arc::downgrade(&transport));

        let discovery = DiscoveryResponse::new(
            server.info(),
            TransportKind::WebSocket,
            [("websocket", self.path.clone())],
        );
        let state = WebSocketState {
            transport: self.clone(),
            server,
        };

        // the handshake carries the bearer token, so auth runs before upgrade
        let protected = Router::new()
            .route(&self.path, get(ws_upgrade))
            .route_layer(middleware::from_fn_with_state(
                self.auth.clone(),
                auth::require_bearer_token,
            ))
            .with_state(state);

        with_common_layers(public_routes(discovery).merge(protected))
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket, server: Arc<dyn Dispatch>) {
        let (mut sink, mut stream) = socket.split();
        let (sender, mut outbound) = mpsc::unbounded_channel::<Outbound>();
        let authenticated = self.auth.is_enabled();
        let connection = self.connections.add(Connection::new(sender, authenticated));
        info!(connection_id = %connection, "websocket connected");

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let text = match frame {
                    Outbound::Message(text) => text,
                    Outbound::Event { event, data } => notification_value(&event, data).to_string(),
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!(connection_id = %connection, "websocket sink closed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(connection_id = %connection, "ignoring non-utf8 binary frame");
                        continue;
                    }
                },
                Ok(WsMessage::Close(_)) => break,
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => continue,
                Err(err) => {
                    debug!(connection_id = %connection, error = %err, "websocket receive failed");
                    break;
                }
            };
            self.handle_frame(&server, &text, connection).await;
        }

        self.connections.remove(connection);
        if writer.await.is_err() {
            warn!(connection_id = %connection, "websocket writer task failed");
        }
        info!(connection_id = %connection, "websocket disconnected");
    }

    async fn handle_frame(
        self: &Arc<Self>,
        server: &Arc<dyn Dispatch>,
        text: &str,
        connection: ConnectionId,
    ) {
        let message = match codec::decode(text) {
            Ok(message) => message,
            Err(err) if err.notification => {
                warn!(connection_id = %connection, error = %err.error, "dropping malformed notification");
                return;
            }
            Err(err) => {
                let reply = codec::encode_response(&err.into_response());
                self.connections
                    .deliver_to(connection, Outbound::Message(reply));
                return;
            }
        };

        let inline = match &message {
            Message::Request(request) => request.method == "initialize",
            Message::Notification(_) | Message::Response(_) => true,
        };
        let transport: Arc<dyn Transport> = self.clone();
        let handle = TransportHandle::new(&transport, Some(connection));
        let dispatch = dispatch_blocking(server.clone(), message, handle, self.request_timeout);

        if inline {
            if let Some(response) = dispatch.await {
                self.reply(connection, &response);
            }
        } else {
            let transport = self.clone();
            tokio::spawn(async move {
                if let Some(response) = dispatch.await {
                    transport.reply(connection, &response);
                }
            });
        }
    }

    fn reply(&self, connection: ConnectionId, response: &RpcResponse) {
        let frame = Outbound::Message(codec::encode_response(response));
        if !self.connections.deliver_to(connection, frame) {
            debug!(connection_id = %connection, "response dropped, connection closed");
        }
    }
}

async fn ws_upgrade(State(state): State<WebSocketState>, ws: WebSocketUpgrade) -> Response {
    let WebSocketState { transport, server } = state;
    ws.on_upgrade(move |socket| transport.handle_socket(socket, server))
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
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
        info!(addr = %self.addr, path = %self.path, "websocket transport listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}
