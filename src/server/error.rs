use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    protocol::error::{self, RpcError},
    server::context::Cancelled,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Failures raised while dispatching a single request.
///
/// Handler failures of `tools/call` never appear here; they are folded into an
/// `isError` result before reaching the dispatch boundary.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("invalid params: {message}")]
    InvalidParams {
        message: String,
        context: Map<String, Value>,
    },
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("server not initialized")]
    NotInitialized,
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    Timeout,
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<Cancelled> for ServerError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl ServerError {
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn invalid_params_with(message: impl Into<String>, context: Value) -> Self {
        let context = match context {
            Value::Object(map) => map,
            other => Map::from_iter([("details".to_string(), other)]),
        };
        Self::InvalidParams {
            message: message.into(),
            context,
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams { .. } | Self::NotFound { .. } => error::INVALID_PARAMS,
            Self::MethodNotFound(_) => error::METHOD_NOT_FOUND,
            Self::NotInitialized => error::SERVER_NOT_INITIALIZED,
            Self::Timeout => error::REQUEST_TIMEOUT,
            Self::Cancelled | Self::Handler(_) | Self::Internal(_) => error::INTERNAL_ERROR,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::InvalidParams { .. }
            | Self::NotFound { .. }
            | Self::MethodNotFound(_)
            | Self::Cancelled => Severity::Info,
            Self::NotInitialized | Self::Timeout => Severity::Warning,
            Self::Handler(_) | Self::Internal(_) => Severity::Error,
        }
    }

    pub fn context(&self) -> Map<String, Value> {
        match self {
            Self::InvalidParams { context, .. } => context.clone(),
            Self::NotFound { kind, name } => Map::from_iter([
                ("code".to_string(), json!(format!("{kind}_not_found"))),
                ("name".to_string(), json!(name)),
            ]),
            Self::MethodNotFound(method) => {
                Map::from_iter([("method".to_string(), json!(method))])
            }
            _ => Map::new(),
        }
    }

    pub fn to_rpc_error(&self) -> RpcError {
        let message = match self {
            Self::InvalidParams { message, .. } => message.clone(),
            Self::NotFound { kind, .. } => format!("{kind} not found"),
            Self::MethodNotFound(_) => "Method not found".to_string(),
            Self::NotInitialized => "Server not initialized".to_string(),
            Self::Cancelled => "Request cancelled".to_string(),
            Self::Timeout => "Request timed out".to_string(),
            Self::Handler(message) | Self::Internal(message) => message.clone(),
        };
        let data = self.context();

        let error = RpcError::new(self.code(), message);
        if data.is_empty() {
            error
        } else {
            error.with_data(Value::Object(data))
        }
    }
}
