//! Envelope dispatch onto the resilient client.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::client::ResilientClient;
use crate::error::{AegisError, Result};
use crate::models::{AnalyzeOptions, CentralConfigUpdate, GuardUpdate, LogEntry};

use super::protocol::{Envelope, EventKind};

/// Maps one envelope to one client operation.
///
/// Every coordinator transport (HTTP, stream framing) funnels through
/// here, so payload parsing and error mapping live in exactly one place.
pub struct Dispatcher {
    client: Arc<ResilientClient>,
}

impl Dispatcher {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<Value> {
        let event = envelope.event().ok_or_else(|| {
            warn!(kind = %envelope.kind, "Rejecting unknown envelope type");
            AegisError::Validation {
                field: "type".to_string(),
                message: format!("unknown envelope type: {}", envelope.kind),
            }
        })?;

        debug!(event = %event, "Dispatching envelope");
        match event {
            EventKind::AnalyzeText => {
                let (text, options) = parse_analyze_payload(&envelope.payload)?;
                let response = self.client.analyze_text(&text, options).await?;
                Ok((*response).clone())
            }
            EventKind::GetGuardStatus => {
                let report = self.client.guard_status().await;
                Ok(serde_json::to_value(report)?)
            }
            EventKind::UpdateGuardConfig => {
                let service = envelope
                    .payload
                    .get("service")
                    .and_then(Value::as_str)
                    .ok_or_else(|| AegisError::Validation {
                        field: "service".to_string(),
                        message: "guard update requires a service name".to_string(),
                    })?;
                let update: GuardUpdate = match envelope.payload.get("update") {
                    Some(update) => serde_json::from_value(update.clone())?,
                    None => GuardUpdate::default(),
                };
                let state = self.client.update_guard_service(service, update).await?;
                Ok(serde_json::to_value(state)?)
            }
            EventKind::GetCentralConfig => {
                let config = self.client.central_config().await?;
                Ok(serde_json::to_value(config)?)
            }
            EventKind::UpdateCentralConfig => {
                let update: CentralConfigUpdate =
                    serde_json::from_value(envelope.payload.clone())?;
                let config = self.client.update_central_config(update).await?;
                Ok(serde_json::to_value(config)?)
            }
            EventKind::SubmitLogBatch => {
                let entries: Vec<LogEntry> = match envelope.payload.get("entries") {
                    Some(entries) => serde_json::from_value(entries.clone())?,
                    None => Vec::new(),
                };
                let submitted = self.client.submit_log_batch(entries).await?;
                Ok(json!({"submitted": submitted}))
            }
            EventKind::GetDiagnostics => {
                let diagnostics = self.client.diagnostics().await?;
                Ok(serde_json::to_value(diagnostics)?)
            }
            EventKind::GetTraceStats => Ok(serde_json::to_value(self.client.stats())?),
            EventKind::TestConnection => {
                let connected = self.client.test_connection().await;
                Ok(json!({"connected": connected}))
            }
        }
    }
}

/// Analyze payloads arrive either as a bare string or as
/// `{"text": ..., "options": {...}}`.
fn parse_analyze_payload(payload: &Value) -> Result<(String, AnalyzeOptions)> {
    match payload {
        Value::String(text) => Ok((text.clone(), AnalyzeOptions::default())),
        Value::Object(map) => {
            let text = map
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| AegisError::Validation {
                    field: "text".to_string(),
                    message: "analyze payload requires a text field".to_string(),
                })?
                .to_string();
            let options = match map.get("options") {
                Some(options) => serde_json::from_value(options.clone())?,
                None => AnalyzeOptions::default(),
            };
            Ok((text, options))
        }
        _ => Err(AegisError::Validation {
            field: "payload".to_string(),
            message: "analyze payload must be a string or an object".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticCredentials, TokenGate};
    use crate::config::Endpoint;
    use crate::locks::LocalLockManager;
    use crate::network::GatewayTransport;
    use crate::storage::{MemoryArea, QuotaManager};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl GatewayTransport for EchoTransport {
        async fn post_json(
            &self,
            _endpoint: Endpoint,
            body: &Value,
            _token: Option<&str>,
        ) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": body.get("text").cloned().unwrap_or(Value::Null)}))
        }

        async fn get(&self, _endpoint: Endpoint, _token: Option<&str>) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"status": "healthy"}))
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<EchoTransport>) {
        let transport = Arc::new(EchoTransport {
            calls: AtomicU32::new(0),
        });
        let quota = Arc::new(QuotaManager::new(
            Arc::new(MemoryArea::new()),
            Arc::new(MemoryArea::new()),
        ));
        let tokens = TokenGate::new(
            Arc::new(StaticCredentials::new("test-token")),
            Arc::new(LocalLockManager::new()),
        );
        let client = Arc::new(ResilientClient::new(
            Arc::clone(&transport) as Arc<dyn GatewayTransport>,
            quota,
            tokens,
        ));
        (Dispatcher::new(client), transport)
    }

    #[tokio::test]
    async fn test_dispatch_analyze_with_object_payload() {
        let (dispatcher, _transport) = dispatcher();

        let envelope = Envelope::new(
            EventKind::AnalyzeText,
            json!({"text": "dispatch me", "options": {"priority": "high"}}),
        );
        let result = dispatcher.dispatch(envelope).await.unwrap();
        assert_eq!(result["echo"], "dispatch me");
    }

    #[tokio::test]
    async fn test_dispatch_analyze_with_string_payload() {
        let (dispatcher, _transport) = dispatcher();

        let envelope = Envelope::new(EventKind::AnalyzeText, json!("bare string"));
        let result = dispatcher.dispatch(envelope).await.unwrap();
        assert_eq!(result["echo"], "bare string");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type_rejected() {
        let (dispatcher, transport) = dispatcher();

        let envelope = Envelope {
            kind: "DROP_TABLES".to_string(),
            payload: Value::Null,
        };
        let err = dispatcher.dispatch(envelope).await.unwrap_err();
        assert!(matches!(err, AegisError::Validation { ref field, .. } if field == "type"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispatch_guard_update_and_status() {
        let (dispatcher, _transport) = dispatcher();

        let update = Envelope::new(
            EventKind::UpdateGuardConfig,
            json!({"service": "securityguard", "update": {"enabled": true}}),
        );
        let state = dispatcher.dispatch(update).await.unwrap();
        assert_eq!(state["enabled"], true);

        let status = dispatcher
            .dispatch(Envelope::new(EventKind::GetGuardStatus, Value::Null))
            .await
            .unwrap();
        assert_eq!(status["guard_services"]["securityguard"]["enabled"], true);
        assert_eq!(status["gateway_connected"], true);
    }

    #[tokio::test]
    async fn test_dispatch_trace_stats_and_diagnostics() {
        let (dispatcher, _transport) = dispatcher();

        dispatcher
            .dispatch(Envelope::new(EventKind::AnalyzeText, json!({"text": "hi"})))
            .await
            .unwrap();

        let stats = dispatcher
            .dispatch(Envelope::new(EventKind::GetTraceStats, Value::Null))
            .await
            .unwrap();
        assert_eq!(stats["requests"], 1);
        assert_eq!(stats["successes"], 1);

        let diagnostics = dispatcher
            .dispatch(Envelope::new(EventKind::GetDiagnostics, Value::Null))
            .await
            .unwrap();
        assert_eq!(diagnostics["circuit_breaker"]["state"], "CLOSED");
        assert!(diagnostics["instance_id"].as_str().unwrap().starts_with("client_"));
    }

    #[tokio::test]
    async fn test_dispatch_log_batch() {
        let (dispatcher, transport) = dispatcher();

        let envelope = Envelope::new(
            EventKind::SubmitLogBatch,
            json!({"entries": [{"level": "info", "message": "hello"}]}),
        );
        let result = dispatcher.dispatch(envelope).await.unwrap();
        assert_eq!(result["submitted"], 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        let empty = Envelope::new(EventKind::SubmitLogBatch, json!({}));
        let err = dispatcher.dispatch(empty).await.unwrap_err();
        assert!(matches!(err, AegisError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_central_config_round_trip() {
        let (dispatcher, _transport) = dispatcher();

        let updated = dispatcher
            .dispatch(Envelope::new(
                EventKind::UpdateCentralConfig,
                json!({"analysis_pipeline": "fast_v1"}),
            ))
            .await
            .unwrap();
        assert_eq!(updated["analysis_pipeline"], "fast_v1");

        let fetched = dispatcher
            .dispatch(Envelope::new(EventKind::GetCentralConfig, Value::Null))
            .await
            .unwrap();
        assert_eq!(fetched["analysis_pipeline"], "fast_v1");
        assert_eq!(fetched["api_key_configured"], true);
    }
}
