//! Per-call request context
//!
//! Carries the cancellation flag, optional progress and log sinks, a metadata
//! bag, and a [`TransportHandle`] back to the transport the call arrived on.
//! Contexts are cheap to clone; clones share cancellation state and metadata.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
    protocol::{codec::notification_value, types::LogLevel, Request, RequestId},
    transport::{
        require, Capability, CapabilitySet, ConnectionId, Delivery, Transport, TransportError,
        TransportKind,
    },
};

pub type ProgressSink = Arc<dyn Fn(&str, f64) + Send + Sync>;
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request was cancelled")]
pub struct Cancelled;

/// Shared, monotonic cancellation flag: once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Capability-scoped back-channel to the transport that owns a request.
///
/// Holds only a weak reference; once the transport is gone every send fails
/// with [`TransportError::Closed`].
#[derive(Clone)]
pub struct TransportHandle {
    kind: TransportKind,
    capabilities: CapabilitySet,
    connection: Option<ConnectionId>,
    transport: Weak<dyn Transport>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("connection", &self.connection)
            .finish()
    }
}

impl TransportHandle {
    pub fn new(transport: &Arc<dyn Transport>, connection: Option<ConnectionId>) -> Self {
        Self {
            kind: transport.kind(),
            capabilities: transport.capabilities(),
            connection,
            transport: Arc::downgrade(transport),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.transport.upgrade().ok_or(TransportError::Closed)
    }

    fn origin(&self) -> Result<ConnectionId, TransportError> {
        self.connection.ok_or(TransportError::NoConnection)
    }

    pub fn send_message(&self, message: &Value, delivery: Delivery) -> Result<usize, TransportError> {
        match delivery {
            Delivery::Origin => {
                require(self.kind, self.capabilities, Capability::Unicast)?;
                let connection = self.origin()?;
                self.transport()?.send_to(connection, message)?;
                Ok(1)
            }
            Delivery::Broadcast => {
                require(self.kind, self.capabilities, Capability::Broadcast)?;
                Ok(self.transport()?.broadcast_message(message))
            }
        }
    }

    pub fn send_event(
        &self,
        event: &str,
        data: &Value,
        delivery: Delivery,
    ) -> Result<usize, TransportError> {
        require(self.kind, self.capabilities, Capability::Events)?;
        let target = match delivery {
            Delivery::Origin => Some(self.origin()?),
            Delivery::Broadcast => None,
        };
        self.transport()?.send_event(event, data, target)
    }
}

#[derive(Clone, Default)]
pub struct RequestContext {
    request_id: Option<RequestId>,
    cancellation: CancellationToken,
    progress: Option<ProgressSink>,
    log: Option<LogSink>,
    metadata: Arc<Mutex<HashMap<String, Value>>>,
    transport: Option<TransportHandle>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("cancelled", &self.is_cancelled())
            .field("has_progress_sink", &self.progress.is_some())
            .field("has_log_sink", &self.log.is_some())
            .field("transport", &self.transport)
            .finish()
    }
}

impl RequestContext {
    pub fn new(request_id: Option<RequestId>) -> Self {
        Self {
            request_id,
            ..Self::default()
        }
    }

    /// Context for a request arriving on a transport.
    ///
    /// Progress is wired to `notifications/progress` when the request carries
    /// `_meta.progressToken`; the log sink emits `notifications/message`. Both
    /// go back to the originating connection only.
    pub fn for_request(request: &Request, transport: Option<TransportHandle>) -> Self {
        let mut ctx = Self::new(Some(request.id.clone()));
        let Some(handle) = transport else {
            return ctx;
        };

        if let Some(token) = request
            .params
            .as_ref()
            .and_then(|params| params.pointer("/_meta/progressToken"))
            .cloned()
        {
            let progress_handle = handle.clone();
            ctx.progress = Some(Arc::new(move |message: &str, ratio: f64| {
                let notification = notification_value(
                    "notifications/progress",
                    json!({
                        "progressToken": token,
                        "progress": ratio,
                        "total": 1.0,
                        "message": message,
                    }),
                );
                if let Err(err) = progress_handle.send_message(&notification, Delivery::Origin) {
                    debug!(error = %err, "progress notification dropped");
                }
            }));
        }

        let log_handle = handle.clone();
        ctx.log = Some(Arc::new(move |level: LogLevel, text: &str| {
            let notification = notification_value(
                "notifications/message",
                json!({ "level": level, "logger": "mcp-runtime", "data": text }),
            );
            if let Err(err) = log_handle.send_message(&notification, Delivery::Origin) {
                debug!(error = %err, "log notification dropped");
            }
        }));

        ctx.transport = Some(handle);
        ctx
    }

    pub fn for_notification(transport: Option<TransportHandle>) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn transport(&self) -> Option<&TransportHandle> {
        self.transport.as_ref()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cooperative checkpoint for long-running handlers.
    pub fn ensure_not_cancelled(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Ratio is forwarded as given; keeping it monotonic is up to the handler.
    pub fn report_progress(&self, message: &str, ratio: f64) {
        if let Some(sink) = &self.progress {
            sink(message, ratio);
        }
    }

    pub fn log_message(&self, level: LogLevel, text: &str) {
        if let Some(sink) = &self.log {
            sink(level, text);
        }
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata.lock().insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.metadata.lock().get(key).cloned()
    }

    pub fn send_notification(
        &self,
        method: &str,
        params: Value,
        delivery: Delivery,
    ) -> Result<usize, TransportError> {
        let handle = self.transport.as_ref().ok_or(TransportError::Closed)?;
        handle.send_message(&notification_value(method, params), delivery)
    }

    pub fn send_event(
        &self,
        event: &str,
        data: Value,
        delivery: Delivery,
    ) -> Result<usize, TransportError> {
        let handle = self.transport.as_ref().ok_or(TransportError::Closed)?;
        handle.send_event(event, &data, delivery)
    }
}
