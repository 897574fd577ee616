//! Envelope types and framing for the coordinator boundary.
//!
//! Execution contexts exchange [`Envelope`] values: a type tag naming the
//! operation plus a JSON payload. Over stream transports, envelopes travel
//! as length-prefixed frames with a hard size cap so a corrupt or hostile
//! peer cannot make the reader allocate unbounded memory.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AegisError, Result};

/// Largest frame accepted on the wire.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One message crossing the coordinator boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
        }
    }

    /// The event this envelope carries, if the type tag is known.
    pub fn event(&self) -> Option<EventKind> {
        EventKind::from_str(&self.kind)
    }
}

/// Operations addressable over the coordinator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AnalyzeText,
    GetGuardStatus,
    UpdateGuardConfig,
    GetCentralConfig,
    UpdateCentralConfig,
    SubmitLogBatch,
    GetDiagnostics,
    GetTraceStats,
    TestConnection,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AnalyzeText => "ANALYZE_TEXT",
            EventKind::GetGuardStatus => "GET_GUARD_STATUS",
            EventKind::UpdateGuardConfig => "UPDATE_GUARD_CONFIG",
            EventKind::GetCentralConfig => "GET_CENTRAL_CONFIG",
            EventKind::UpdateCentralConfig => "UPDATE_CENTRAL_CONFIG",
            EventKind::SubmitLogBatch => "SUBMIT_LOG_BATCH",
            EventKind::GetDiagnostics => "GET_DIAGNOSTICS",
            EventKind::GetTraceStats => "GET_TRACE_STATS",
            EventKind::TestConnection => "TEST_GATEWAY_CONNECTION",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ANALYZE_TEXT" => Some(EventKind::AnalyzeText),
            "GET_GUARD_STATUS" => Some(EventKind::GetGuardStatus),
            "UPDATE_GUARD_CONFIG" => Some(EventKind::UpdateGuardConfig),
            "GET_CENTRAL_CONFIG" => Some(EventKind::GetCentralConfig),
            "UPDATE_CENTRAL_CONFIG" => Some(EventKind::UpdateCentralConfig),
            "SUBMIT_LOG_BATCH" => Some(EventKind::SubmitLogBatch),
            "GET_DIAGNOSTICS" => Some(EventKind::GetDiagnostics),
            "GET_TRACE_STATS" => Some(EventKind::GetTraceStats),
            "TEST_GATEWAY_CONNECTION" => Some(EventKind::TestConnection),
            _ => None,
        }
    }

    pub const ALL: [EventKind; 9] = [
        EventKind::AnalyzeText,
        EventKind::GetGuardStatus,
        EventKind::UpdateGuardConfig,
        EventKind::GetCentralConfig,
        EventKind::UpdateCentralConfig,
        EventKind::SubmitLogBatch,
        EventKind::GetDiagnostics,
        EventKind::GetTraceStats,
        EventKind::TestConnection,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Write one envelope as a 4-byte big-endian length prefix plus JSON body.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(AegisError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame of {} bytes exceeds the {} byte cap",
                body.len(),
                MAX_FRAME_BYTES
            ),
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope, rejecting frames over the cap
/// before any body allocation.
pub async fn read_frame<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(AegisError::Validation {
            field: "frame".to_string(),
            message: format!(
                "frame of {} bytes exceeds the {} byte cap",
                len, MAX_FRAME_BYTES
            ),
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let envelope = serde_json::from_slice(&body)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_str("NOT_A_TYPE"), None);
        assert_eq!(EventKind::from_str("analyze_text"), None);
    }

    #[test]
    fn test_envelope_uses_type_tag() {
        let envelope = Envelope::new(EventKind::AnalyzeText, json!({"text": "hi"}));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["type"], "ANALYZE_TEXT");
        assert_eq!(wire["payload"]["text"], "hi");

        let parsed: Envelope =
            serde_json::from_value(json!({"type": "GET_TRACE_STATS"})).unwrap();
        assert_eq!(parsed.event(), Some(EventKind::GetTraceStats));
        assert!(parsed.payload.is_null());
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = Envelope::new(EventKind::GetDiagnostics, json!({"detail": "full"}));
        write_frame(&mut client, &sent).await.unwrap();

        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received.kind, "GET_DIAGNOSTICS");
        assert_eq!(received.payload, json!({"detail": "full"}));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_read() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let huge_len = (MAX_FRAME_BYTES as u32 + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &huge_len)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, AegisError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_truncated_frame_errors() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc")
            .await
            .unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, AegisError::Io { .. }));
    }

    #[tokio::test]
    async fn test_oversized_envelope_not_written() {
        let (mut client, _server) = tokio::io::duplex(64);

        let body = "x".repeat(MAX_FRAME_BYTES);
        let envelope = Envelope::new(EventKind::AnalyzeText, json!({"text": body}));
        let err = write_frame(&mut client, &envelope).await.unwrap_err();
        assert!(matches!(err, AegisError::Validation { .. }));
    }
}
