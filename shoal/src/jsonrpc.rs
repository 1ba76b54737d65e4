//! JSON-RPC 2.0 helper layer: frame types, constructors and a dispatch
//! routine that routes a request payload to a method table. The JSON codec
//! is `serde_json`; this module only shapes the frames.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

const VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: &str) -> RpcError {
        RpcError {
            code,
            message: message.to_string(),
            data: None,
        }
    }
}

/// A dispatchable method: params in, result or error out.
pub type RpcMethod = fn(&Value) -> Result<Value, RpcError>;

pub fn build_request(id: u64, method: &str, params: Value) -> String {
    let frame = RpcRequest {
        jsonrpc: VERSION.to_string(),
        id: Some(Value::from(id)),
        method: method.to_string(),
        params,
    };

    serde_json::to_string(&frame).expect("Request frame must serialize")
}

pub fn build_reply(id: Value, result: Value) -> String {
    let frame = RpcResponse {
        jsonrpc: VERSION.to_string(),
        id,
        result: Some(result),
        error: None,
    };

    serde_json::to_string(&frame).expect("Response frame must serialize")
}

pub fn build_error(id: Value, code: i64, message: &str) -> String {
    let frame = RpcResponse {
        jsonrpc: VERSION.to_string(),
        id,
        result: None,
        error: Some(RpcError::new(code, message)),
    };

    serde_json::to_string(&frame).expect("Response frame must serialize")
}

/// Parses `payload` as a request, routes it through `methods` and returns
/// the serialized reply.
pub fn dispatch(payload: &[u8], methods: &[(&str, RpcMethod)]) -> String {
    let request: RpcRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(_) => return build_error(Value::Null, PARSE_ERROR, "parse error"),
    };

    let id = request.id.clone().unwrap_or(Value::Null);

    if request.jsonrpc != VERSION {
        return build_error(id, INVALID_REQUEST, "unsupported jsonrpc version");
    }

    let method = methods
        .iter()
        .find(|(name, _)| *name == request.method)
        .map(|(_, method)| *method);

    match method {
        Some(method) => match method(&request.params) {
            Ok(result) => build_reply(id, result),
            Err(error) => {
                let frame = RpcResponse {
                    jsonrpc: VERSION.to_string(),
                    id,
                    result: None,
                    error: Some(error),
                };
                serde_json::to_string(&frame).expect("Response frame must serialize")
            }
        },
        None => build_error(id, METHOD_NOT_FOUND, "method not found"),
    }
}
