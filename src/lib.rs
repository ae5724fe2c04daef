use std::sync::Arc;

use thiserror::Error;
use tracing::info;

pub mod auth;
pub mod compose;
pub mod config;
pub mod demo;
pub mod errors;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod template;
pub mod transport;

pub use compose::{ComposedServer, MountPoint};
pub use config::{Config, ConfigError, TransportChoice};
pub use server::{Catalog, Dispatch, McpServer, RequestContext, ServerError};
pub use transport::{
    http::HttpTransport, sse::SseTransport, stdio::StdioTransport,
    websocket::WebSocketTransport, Transport, TransportError, TransportKind,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Builds the transport selected by `config`, with its auth and timeout
/// settings applied.
pub fn build_transport(config: &Config) -> Result<Arc<dyn Transport>, StartupError> {
    let addr = config.bind_socket()?;
    let auth = config.auth();

    let transport: Arc<dyn Transport> = match config.transport {
        TransportChoice::Stdio => Arc::new(StdioTransport::new(config.worker_threads)?),
        TransportChoice::Http => Arc::new(
            HttpTransport::new(addr, config.http_path.clone())
                .with_auth(auth)
                .with_request_timeout(config.request_timeout),
        ),
        TransportChoice::WebSocket => Arc::new(
            WebSocketTransport::new(addr, config.ws_path.clone())
                .with_auth(auth)
                .with_request_timeout(config.request_timeout),
        ),
        TransportChoice::Sse => Arc::new(
            SseTransport::new(addr, config.sse_path.clone(), config.message_path.clone())
                .with_auth(auth)
                .with_request_timeout(config.request_timeout),
        ),
    };
    Ok(transport)
}

pub async fn serve(config: &Config, server: Arc<dyn Dispatch>) -> Result<(), StartupError> {
    let transport = build_transport(config)?;
    info!(
        transport = %transport.kind(),
        server = %server.info().name,
        auth = config.api_token.is_some(),
        "runtime starting"
    );
    transport.serve(server).await?;
    Ok(())
}
