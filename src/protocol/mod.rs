//! Model Context Protocol wire layer
//!
//! JSON-RPC envelope codec, the error code table, and the MCP payload types.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode, decode_value, encode, encode_response, Message, Notification, Request, RequestId,
    Response, ResponsePayload,
};
pub use error::RpcError;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];
