use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Maximum size of a JSON-lines frame on either the duplex channel or the
/// local socket (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Liveness probe sent by the relay client whenever the channel is idle.
pub const HEARTBEAT: &str = "heartbeat";
/// Resolve an item and project fields out of it with a query.
pub const GET_QUERY_ITEM: &str = "getQueryItem";
/// Reserved by the local socket bridge; never forwarded over the channel.
pub const SHUTDOWN: &str = "shutdown";

/// Result carried by every heartbeat response.
pub const HEARTBEAT_ACK: &str = "ack";

/// Correlation token pairing a request with its response.
///
/// Local callers may use integers or strings; the relay always mints random
/// UUID strings so its IDs never collide with a caller's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl Id {
    /// A fresh random (UUID v4) string ID.
    pub fn random() -> Self {
        Id::String(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

/// The `"jsonrpc": "2.0"` marker. Always written; optional on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == "2.0" {
            Ok(JsonRpcVersion)
        } else {
            Err(de::Error::custom(format!(
                "unsupported jsonrpc version {version:?}"
            )))
        }
    }
}

/// Machine-readable kind of an RPC failure, encoded as a JSON-RPC integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum ErrorCode {
    /// Malformed message or request parameters.
    ParseError,
    /// Business failure: item not found, query evaluation failed, or a
    /// message that is not a request.
    InvalidRequest,
    /// Method unknown to the receiver.
    MethodNotHandled,
    /// A collaborator (e.g. the item source) is unavailable.
    InternalError,
    /// The duplex channel broke before a response arrived.
    Transport,
    /// The caller's wait was cancelled, timed out, or the bridge is stopping.
    Cancelled,
    Other(i64),
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotHandled => -32601,
            ErrorCode::InternalError => -32603,
            ErrorCode::Transport => -32003,
            ErrorCode::Cancelled => -32800,
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotHandled,
            -32603 => ErrorCode::InternalError,
            -32003 => ErrorCode::Transport,
            -32800 => ErrorCode::Cancelled,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ParseError => f.write_str("parse error"),
            ErrorCode::InvalidRequest => f.write_str("invalid request"),
            ErrorCode::MethodNotHandled => f.write_str("method not handled"),
            ErrorCode::InternalError => f.write_str("internal error"),
            ErrorCode::Transport => f.write_str("transport error"),
            ErrorCode::Cancelled => f.write_str("cancelled"),
            ErrorCode::Other(code) => write!(f, "error {code}"),
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_handled(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotHandled,
            format!("method not handled: {method}"),
        )
    }
}

/// A call (with `id`) or a notification (without).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    jsonrpc: JsonRpcVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn call(id: impl Into<Id>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            method: method.into(),
            params,
        }
    }

    /// A heartbeat call with a fresh random ID and no params.
    pub fn heartbeat() -> Self {
        Self::call(Id::random(), HEARTBEAT, Value::Null)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Completes exactly one earlier request. Exactly one of result/error is
/// present on the wire; `outcome` makes that structural.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse", into = "RawResponse")]
pub struct Response {
    pub id: Option<Id>,
    pub outcome: Result<Value, RpcError>,
}

impl Response {
    pub fn ok(id: Option<Id>, result: Value) -> Self {
        Self {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: Option<Id>, error: RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

#[derive(Serialize, Deserialize)]
struct RawResponse {
    #[serde(default)]
    jsonrpc: JsonRpcVersion,
    #[serde(default)]
    id: Option<Id>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Keeps `"result": null` distinct from an absent `result`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for Response {
    type Error = &'static str;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(error),
            (Some(_), Some(_)) => return Err("response carries both result and error"),
            (None, None) => return Err("response carries neither result nor error"),
        };
        Ok(Self {
            id: raw.id,
            outcome,
        })
    }
}

impl From<Response> for RawResponse {
    fn from(resp: Response) -> Self {
        let (result, error) = match resp.outcome {
            Ok(result) => (Some(result), None),
            Err(error) => (None, Some(error)),
        };
        Self {
            jsonrpc: JsonRpcVersion,
            id: resp.id,
            result,
            error,
        }
    }
}

/// Any single frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let is_request = value
            .as_object()
            .is_some_and(|obj| obj.contains_key("method"));
        if is_request {
            Request::deserialize(value)
                .map(Message::Request)
                .map_err(de::Error::custom)
        } else {
            Response::deserialize(value)
                .map(Message::Response)
                .map_err(de::Error::custom)
        }
    }
}

impl Message {
    /// Decode one JSON-lines frame.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Encode as a single line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

/// Params of `getQueryItem`. Member names are capitalised on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetQueryItemParams {
    #[serde(rename = "Item")]
    pub item: String,
    #[serde(rename = "Query")]
    pub query: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip_keeps_id_method_and_params() {
        let params = serde_json::to_value(GetQueryItemParams {
            item: "github".to_string(),
            query: ".fields".to_string(),
        })
        .unwrap();
        let req = Request::call("abc-123", GET_QUERY_ITEM, params.clone());

        let line = Message::from(req).to_line().unwrap();
        assert!(!line.contains('\n'));
        let Message::Request(decoded) = Message::from_line(&line).unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(decoded.id, Some(Id::from("abc-123")));
        assert_eq!(decoded.method, GET_QUERY_ITEM);
        assert_eq!(decoded.params, params);
    }

    #[test]
    fn response_round_trip_with_result_and_with_error() {
        let ok = Response::ok(Some(Id::Number(7)), json!("{\"a\":\"b\"}"));
        let line = serde_json::to_string(&ok).unwrap();
        assert!(!line.contains("\"error\""));
        assert_eq!(serde_json::from_str::<Response>(&line).unwrap(), ok);

        let err = Response::error(
            Some(Id::from("x")),
            RpcError::new(ErrorCode::InvalidRequest, "item not found"),
        );
        let line = serde_json::to_string(&err).unwrap();
        assert!(!line.contains("\"result\""));
        assert!(line.contains("-32600"));
        assert_eq!(serde_json::from_str::<Response>(&line).unwrap(), err);
    }

    #[test]
    fn null_result_is_a_result() {
        let resp: Response = serde_json::from_str(r#"{"id":1,"result":null}"#).unwrap();
        assert_eq!(resp.outcome, Ok(Value::Null));
    }

    #[test]
    fn response_must_carry_exactly_one_of_result_or_error() {
        let both = r#"{"id":1,"result":"x","error":{"code":-32603,"message":"boom"}}"#;
        assert!(serde_json::from_str::<Response>(both).is_err());

        let neither = r#"{"id":1}"#;
        assert!(serde_json::from_str::<Response>(neither).is_err());
    }

    #[test]
    fn message_discriminates_on_method() {
        let req = Message::from_line(r#"{"jsonrpc":"2.0","id":"h1","method":"heartbeat"}"#).unwrap();
        match req {
            Message::Request(r) => {
                assert_eq!(r.method, HEARTBEAT);
                assert_eq!(r.params, Value::Null);
            }
            other => panic!("expected request, got {other:?}"),
        }

        let resp = Message::from_line(r#"{"id":"h1","result":"ack"}"#).unwrap();
        assert!(matches!(resp, Message::Response(_)));
    }

    #[test]
    fn wrong_jsonrpc_version_is_rejected() {
        assert!(Message::from_line(r#"{"jsonrpc":"1.0","id":1,"method":"heartbeat"}"#).is_err());
    }

    #[test]
    fn notification_has_no_id_on_the_wire() {
        let line = Message::from(Request::notification(SHUTDOWN, Value::Null))
            .to_line()
            .unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"shutdown"}"#);
    }

    #[test]
    fn unknown_error_codes_survive_decoding() {
        let resp: Response =
            serde_json::from_str(r#"{"id":2,"error":{"code":-32099,"message":"odd"}}"#).unwrap();
        let err = resp.outcome.unwrap_err();
        assert_eq!(err.code, ErrorCode::Other(-32099));
        assert_eq!(i64::from(err.code), -32099);
    }

    #[test]
    fn get_query_item_params_use_capitalised_names() {
        let params: GetQueryItemParams =
            serde_json::from_value(json!({"Item": "db", "Query": ".password"})).unwrap();
        assert_eq!(params.item, "db");
        assert_eq!(params.query, ".password");
    }

    #[test]
    fn random_ids_are_distinct_strings() {
        let (a, b) = (Id::random(), Id::random());
        assert_ne!(a, b);
        assert!(matches!(a, Id::String(_)));
    }
}
