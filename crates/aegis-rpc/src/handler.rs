//! JSON-RPC request handlers.

use crate::server::AppState;
use aegis_core::Envelope;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// JSON-RPC "Invalid Request" error code.
const INVALID_REQUEST: i32 = -32600;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
///
/// Accepts either a JSON-RPC 2.0 request whose `method` and `params` name an
/// envelope, or a bare envelope object (`{"type": ..., "payload": ...}`).
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let (envelope, id) = match parse_request(body) {
        Ok(parsed) => parsed,
        Err(message) => {
            return (
                StatusCode::OK,
                Json(JsonRpcResponse::error(None, INVALID_REQUEST, message)),
            );
        }
    };

    let kind = envelope.kind.clone();
    debug!("RPC call: {}({:?})", kind, envelope.payload);

    match state.dispatcher.dispatch(envelope).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {}", kind, e);
            let code = e.to_rpc_error_code();
            (
                StatusCode::OK,
                Json(JsonRpcResponse::error(id, code, e.to_string())),
            )
        }
    }
}

/// Turn an incoming request body into an envelope plus the response id.
fn parse_request(body: Value) -> Result<(Envelope, Option<Value>), String> {
    if body.get("method").is_some() {
        let request: JsonRpcRequest = serde_json::from_value(body)
            .map_err(|e| format!("malformed JSON-RPC request: {}", e))?;
        let envelope = Envelope {
            kind: request.method,
            payload: request.params.unwrap_or(Value::Object(Default::default())),
        };
        return Ok((envelope, request.id));
    }

    if body.get("type").is_some() {
        let envelope: Envelope =
            serde_json::from_value(body).map_err(|e| format!("malformed envelope: {}", e))?;
        return Ok((envelope, None));
    }

    Err("expected a JSON-RPC request or an envelope object".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonrpc_request() {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "ANALYZE_TEXT",
            "params": {"text": "hello"},
            "id": 7
        });

        let (envelope, id) = parse_request(body).unwrap();
        assert_eq!(envelope.kind, "ANALYZE_TEXT");
        assert_eq!(envelope.payload["text"], "hello");
        assert_eq!(id, Some(json!(7)));
    }

    #[test]
    fn test_parse_jsonrpc_request_without_params() {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "GET_TRACE_STATS",
            "id": 1
        });

        let (envelope, _) = parse_request(body).unwrap();
        assert_eq!(envelope.kind, "GET_TRACE_STATS");
        assert!(envelope.payload.is_object());
    }

    #[test]
    fn test_parse_bare_envelope() {
        let body = json!({
            "type": "GET_CENTRAL_CONFIG",
            "payload": {}
        });

        let (envelope, id) = parse_request(body).unwrap();
        assert_eq!(envelope.kind, "GET_CENTRAL_CONFIG");
        assert_eq!(id, None);
    }

    #[test]
    fn test_parse_rejects_unrecognized_shape() {
        let err = parse_request(json!({"hello": "world"})).unwrap_err();
        assert!(err.contains("expected"));
    }
}
