//! Integration tests for the aegis-rpc JSON-RPC server.
//!
//! Each test spawns the compiled binary with a fresh data directory and a
//! gateway URL pointing at an unused local port, then drives it over HTTP.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncBufReadExt;

/// Gateway URL no listener answers on, so connection attempts fail fast.
const DEAD_GATEWAY_URL: &str = "http://127.0.0.1:9";

/// Make an RPC call and return its `result`, or the error payload as a string.
async fn rpc_call(port: u16, method: &str, params: Value) -> Result<Value, String> {
    let json = rpc_call_raw(port, method, params).await?;
    if let Some(error) = json.get("error") {
        return Err(error.to_string());
    }
    Ok(json.get("result").cloned().unwrap_or(Value::Null))
}

/// Make an RPC call and return the full JSON-RPC payload.
async fn rpc_call_raw(port: u16, method: &str, params: Value) -> Result<Value, String> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/rpc", port))
        .json(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    response.json::<Value>().await.map_err(|e| e.to_string())
}

/// Post a bare envelope object and return the full response payload.
async fn envelope_call(port: u16, kind: &str, payload: Value) -> Result<Value, String> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/rpc", port))
        .json(&json!({"type": kind, "payload": payload}))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    response.json::<Value>().await.map_err(|e| e.to_string())
}

/// Check health endpoint.
async fn check_health(port: u16) -> bool {
    let client = reqwest::Client::new();
    if let Ok(response) = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        if let Ok(json) = response.json::<Value>().await {
            return json.get("status").and_then(|v| v.as_str()) == Some("ok");
        }
    }
    false
}

/// Wait for server to be ready.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if check_health(port).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct RpcServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Start the RPC binary and wait until `/health` is ready.
async fn start_rpc_server(data_dir: &std::path::Path) -> Result<RpcServerHandle, String> {
    let binary = if let Ok(path) = std::env::var("CARGO_BIN_EXE_aegis-rpc") {
        PathBuf::from(path)
    } else {
        let current_exe = std::env::current_exe()
            .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
        let target_debug_dir = current_exe
            .parent()
            .and_then(|p| p.parent())
            .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

        let mut fallback = target_debug_dir.join("aegis-rpc");
        if cfg!(target_os = "windows") {
            fallback.set_extension("exe");
        }
        if !fallback.exists() {
            return Err(format!(
                "CARGO_BIN_EXE_aegis-rpc not set and fallback binary not found at {}",
                fallback.display()
            ));
        }
        fallback
    };

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--gateway-url")
        .arg(DEAD_GATEWAY_URL)
        .env_remove("AEGIS_API_KEY")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn aegis-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read aegis-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by aegis-rpc".to_string())?;
    if !wait_for_server(port, 15).await {
        return Err(format!("aegis-rpc failed health check on port {port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

#[tokio::test]
async fn test_server_reports_trace_stats() {
    let env = TempDir::new().unwrap();
    let server = start_rpc_server(env.path()).await.unwrap();
    let port = server.port;

    let stats = rpc_call(port, "GET_TRACE_STATS", json!({})).await.unwrap();
    assert_eq!(stats.get("requests").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(stats.get("successes").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(stats.get("success_rate").and_then(|v| v.as_f64()), Some(0.0));

    server.stop().await;
}

#[tokio::test]
async fn test_bare_envelope_form_is_accepted() {
    let env = TempDir::new().unwrap();
    let server = start_rpc_server(env.path()).await.unwrap();
    let port = server.port;

    let payload = envelope_call(port, "GET_CENTRAL_CONFIG", json!({}))
        .await
        .unwrap();
    assert!(payload.get("error").is_none());
    assert!(payload.get("id").map(|v| v.is_null()).unwrap_or(false));

    let config = payload.get("result").expect("missing result");
    assert_eq!(
        config.get("gateway_url").and_then(|v| v.as_str()),
        Some(DEAD_GATEWAY_URL)
    );
    assert_eq!(
        config.get("analysis_pipeline").and_then(|v| v.as_str()),
        Some("default")
    );
    assert_eq!(
        config.get("api_key_configured").and_then(|v| v.as_bool()),
        Some(false)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_guard_update_visible_in_status() {
    let env = TempDir::new().unwrap();
    let server = start_rpc_server(env.path()).await.unwrap();
    let port = server.port;

    let updated = rpc_call(
        port,
        "UPDATE_GUARD_CONFIG",
        json!({"service": "securityguard", "update": {"enabled": true, "threshold": 0.9}}),
    )
    .await
    .unwrap();
    assert_eq!(updated.get("enabled").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(updated.get("threshold").and_then(|v| v.as_f64()), Some(0.9));

    let status = rpc_call(port, "GET_GUARD_STATUS", json!({})).await.unwrap();
    let services = status.get("guard_services").expect("missing guard_services");
    assert_eq!(
        services
            .get("securityguard")
            .and_then(|s| s.get("enabled"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_returns_validation_error() {
    let env = TempDir::new().unwrap();
    let server = start_rpc_server(env.path()).await.unwrap();
    let port = server.port;

    let payload = rpc_call_raw(port, "NOT_A_REAL_METHOD", json!({}))
        .await
        .unwrap();
    let error = payload
        .get("error")
        .expect("expected JSON-RPC error payload");
    assert_eq!(error.get("code").and_then(|v| v.as_i64()), Some(-32005));
    assert!(error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .contains("unknown envelope type"));

    server.stop().await;
}

#[tokio::test]
async fn test_connection_probe_reports_unreachable_gateway() {
    let env = TempDir::new().unwrap();
    let server = start_rpc_server(env.path()).await.unwrap();
    let port = server.port;

    let result = rpc_call(port, "TEST_GATEWAY_CONNECTION", json!({}))
        .await
        .unwrap();
    assert_eq!(
        result.get("connected").and_then(|v| v.as_bool()),
        Some(false)
    );

    server.stop().await;
}
