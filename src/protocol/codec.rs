//! JSON-RPC 2.0 envelope decoding and encoding
//!
//! Pure and stateless: raw text in, [`Message`] out, and back. Decoding failures
//! carry the request id when one could be recovered so the error can still be
//! correlated by the client.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::error::RpcError;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(id) => Some(Self::String(id.clone())),
            Value::Number(number) => number.as_i64().map(Self::Number),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(id) => Value::Number((*id).into()),
            Self::String(id) => Value::String(id.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::String(id) => write!(f, "{id:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` only for errors raised before an id could be read.
    pub id: Option<RequestId>,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(value) => Some(value),
            ResponsePayload::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(error) => Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub id: Option<RequestId>,
    pub error: RpcError,
    /// The rejected message was notification-shaped (a method and no id) and
    /// must not be answered.
    pub notification: bool,
}

impl DecodeError {
    fn invalid_request(id: Option<RequestId>, detail: &str) -> Self {
        Self {
            id,
            error: RpcError::invalid_request(detail),
            notification: false,
        }
    }

    fn silenced(mut self, notification: bool) -> Self {
        self.notification = notification;
        self
    }

    pub fn into_response(self) -> Response {
        Response::failure(self.id, self.error)
    }
}

pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|err| DecodeError {
        id: None,
        error: RpcError::parse_error(err.to_string()),
        notification: false,
    })?;
    decode_value(value)
}

pub fn decode_value(value: Value) -> Result<Message, DecodeError> {
    let Value::Object(mut object) = value else {
        return Err(DecodeError::invalid_request(
            None,
            "message must be a JSON object",
        ));
    };

    let raw_id = object.remove("id");
    let id = raw_id.as_ref().and_then(RequestId::from_value);
    let notification = raw_id.is_none() && object.contains_key("method");

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(
            DecodeError::invalid_request(id, "jsonrpc must be exactly \"2.0\"")
                .silenced(notification),
        );
    }

    if let Some(method) = object.remove("method") {
        let method = match method {
            Value::String(method) if !method.trim().is_empty() => method,
            _ => {
                return Err(
                    DecodeError::invalid_request(id, "method must be a non-empty string")
                        .silenced(notification),
                )
            }
        };

        let params = match object.remove("params") {
            None | Some(Value::Null) => None,
            Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
            Some(_) => {
                return Err(
                    DecodeError::invalid_request(id, "params must be an object or an array")
                        .silenced(notification),
                )
            }
        };

        return match (raw_id, id) {
            (None, _) => Ok(Message::Notification(Notification { method, params })),
            (Some(_), Some(id)) => Ok(Message::Request(Request { id, method, params })),
            (Some(_), None) => Err(DecodeError::invalid_request(
                None,
                "id must be a string or an integer",
            )),
        };
    }

    let result = object.remove("result");
    let error = object.remove("error");
    if result.is_none() && error.is_none() {
        return Err(DecodeError::invalid_request(id, "missing method"));
    }

    let Some(raw_id) = raw_id else {
        return Err(DecodeError::invalid_request(None, "response is missing id"));
    };
    if id.is_none() && !raw_id.is_null() {
        return Err(DecodeError::invalid_request(
            None,
            "id must be a string, an integer or null",
        ));
    }

    let payload = match (result, error) {
        (Some(result), None) => ResponsePayload::Result(result),
        (None, Some(error)) => match serde_json::from_value::<RpcError>(error) {
            Ok(error) => ResponsePayload::Error(error),
            Err(_) => {
                return Err(DecodeError::invalid_request(
                    id,
                    "error must carry an integer code and a message",
                ))
            }
        },
        _ => {
            return Err(DecodeError::invalid_request(
                id,
                "response must carry exactly one of result or error",
            ))
        }
    };

    Ok(Message::Response(Response { id, payload }))
}

pub fn to_value(message: &Message) -> Value {
    let mut object = Map::new();
    object.insert(
        "jsonrpc".to_string(),
        Value::String(JSONRPC_VERSION.to_string()),
    );

    match message {
        Message::Request(request) => {
            object.insert("id".to_string(), request.id.to_value());
            object.insert("method".to_string(), Value::String(request.method.clone()));
            if let Some(params) = &request.params {
                object.insert("params".to_string(), params.clone());
            }
        }
        Message::Notification(notification) => {
            object.insert(
                "method".to_string(),
                Value::String(notification.method.clone()),
            );
            if let Some(params) = &notification.params {
                object.insert("params".to_string(), params.clone());
            }
        }
        Message::Response(response) => {
            object.insert(
                "id".to_string(),
                response
                    .id
                    .as_ref()
                    .map(RequestId::to_value)
                    .unwrap_or(Value::Null),
            );
            match &response.payload {
                ResponsePayload::Result(result) => {
                    object.insert("result".to_string(), result.clone());
                }
                ResponsePayload::Error(error) => {
                    object.insert(
                        "error".to_string(),
                        serde_json::to_value(error).expect("rpc error serialization"),
                    );
                }
            }
        }
    }

    Value::Object(object)
}

pub fn encode(message: &Message) -> String {
    to_value(message).to_string()
}

pub fn encode_response(response: &Response) -> String {
    response_value(response).to_string()
}

pub fn response_value(response: &Response) -> Value {
    to_value(&Message::Response(response.clone()))
}

pub fn notification_value(method: &str, params: Value) -> Value {
    to_value(&Message::notification(method, Some(params)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::protocol::error::{INVALID_REQUEST, PARSE_ERROR};

    #[test]
    fn decodes_request_with_integer_id() {
        let message = decode(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list","params":{}}"#)
            .expect("valid request");

        assert_eq!(
            message,
            Message::request(7, "tools/list", Some(json!({})))
        );
    }

    #[test]
    fn message_without_id_is_a_notification() {
        let message = decode(r#"{"jsonrpc":"2.0","method":"initialized"}"#).expect("valid");

        assert_eq!(message, Message::notification("initialized", None));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let error = decode("{\"jsonrpc\":").expect_err("must fail");

        assert_eq!(error.error.code, PARSE_ERROR);
        assert_eq!(error.id, None);
    }

    #[test]
    fn missing_jsonrpc_is_invalid_request_with_recovered_id() {
        let error = decode(r#"{"id":"abc","method":"ping"}"#).expect_err("must fail");

        assert_eq!(error.error.code, INVALID_REQUEST);
        assert_eq!(error.id, Some(RequestId::from("abc")));
    }

    #[test]
    fn missing_method_is_invalid_request() {
        let error = decode(r#"{"jsonrpc":"2.0","id":1}"#).expect_err("must fail");

        assert_eq!(error.error.code, INVALID_REQUEST);
        assert_eq!(error.id, Some(RequestId::Number(1)));
    }

    #[test]
    fn invalid_notification_is_flagged_unanswerable() {
        let error = decode(r#"{"method":"notifications/progress"}"#).expect_err("fail");

        assert_eq!(error.error.code, INVALID_REQUEST);
        assert!(error.notification);
    }

    #[test]
    fn fractional_id_is_rejected() {
        let error = decode(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).expect_err("fail");

        assert_eq!(error.error.code, INVALID_REQUEST);
    }

    #[test]
    fn scalar_params_are_rejected() {
        let error =
            decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping","params":3}"#).expect_err("fail");

        assert_eq!(error.error.code, INVALID_REQUEST);
    }

    #[test]
    fn re_encoding_preserves_id_kind() {
        for raw in [
            r#"{"jsonrpc":"2.0","id":"req-1","method":"tools/call","params":{"name":"echo"}}"#,
            r#"{"jsonrpc":"2.0","id":12,"result":{"tools":[]}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#,
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#,
        ] {
            let original: Value = serde_json::from_str(raw).expect("fixture json");
            let encoded = encode(&decode(raw).expect("fixture decodes"));
            let reparsed: Value = serde_json::from_str(&encoded).expect("encoded json");

            assert_eq!(reparsed, original, "round trip of {raw}");
        }
    }

    #[test]
    fn response_without_id_encodes_null_id() {
        let response = Response::failure(None, RpcError::parse_error("eof"));
        let value: Value = serde_json::from_str(&encode_response(&response)).expect("json");

        assert!(value["id"].is_null());
        assert_eq!(value["error"]["code"], -32700);
    }
}
