//! JSON-RPC error envelope and the closed code table
//!
//! Every failure that reaches the wire is an [`RpcError`]. Codes in the
//! `-32000..=-32099` band are application codes owned by this runtime.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const REQUEST_TIMEOUT: i64 = -32001;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} ({code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, "Parse error").with_data(json!({ "details": detail.into() }))
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, "Invalid Request").with_data(json!({ "details": detail.into() }))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, "Method not found").with_data(json!({ "method": method }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    pub fn server_not_initialized() -> Self {
        Self::new(SERVER_NOT_INITIALIZED, "Server not initialized")
    }

    pub fn request_timeout() -> Self {
        Self::new(REQUEST_TIMEOUT, "Request timed out")
    }

    /// Reserved JSON-RPC codes live in `-32768..=-32000`; anything else is application-defined.
    pub fn is_reserved(&self) -> bool {
        (-32768..=-32000).contains(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_is_omitted_when_absent() {
        let value = serde_json::to_value(RpcError::invalid_params("tool not found"))
            .expect("error serialization");

        assert_eq!(value, json!({"code": -32602, "message": "tool not found"}));
    }

    #[test]
    fn standard_constructors_use_standard_codes() {
        assert_eq!(RpcError::parse_error("eof").code, -32700);
        assert_eq!(RpcError::invalid_request("no method").code, -32600);
        assert_eq!(RpcError::method_not_found("x/y").code, -32601);
        assert_eq!(RpcError::internal("boom").code, -32603);
        assert!(RpcError::server_not_initialized().is_reserved());
        assert!(!RpcError::new(42, "custom").is_reserved());
    }
}
