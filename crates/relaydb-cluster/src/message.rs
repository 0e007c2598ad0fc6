//! Inter-node message envelope and payload types.
//!
//! Every frame carries `{sender_id, type, payload, checksum}` where the
//! checksum is SHA-256 (hex) over the canonical serialization of the
//! payload: JSON with object keys sorted recursively. A frame whose
//! checksum does not verify is dropped before dispatch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::NodeId;
use crate::error::{ClusterError, ErrorCode, Result};

/// Sender id used by clients, which are not cluster members.
pub const CLIENT_SENDER: NodeId = 0;

/// Discriminator for every message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Heartbeat,
    Election,
    Alive,
    Coordinator,
    ClientRequest,
    ClientReply,
    Prepare,
    Vote,
    Commit,
    Abort,
    Ack,
    ExecuteRead,
    ReadResult,
    TxnStatus,
    TxnStatusReply,
}

/// One transport unit; lives only between encode and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    pub checksum: String,
}

impl Envelope {
    pub fn new<T: Serialize>(sender_id: NodeId, kind: MessageKind, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        let checksum = payload_checksum(&payload);
        Ok(Envelope {
            sender_id,
            kind,
            payload,
            checksum,
        })
    }

    /// Recompute and compare the payload checksum.
    pub fn verify(&self) -> bool {
        payload_checksum(&self.payload) == self.checksum
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ClusterError::Transport(format!("bad {:?} payload: {e}", self.kind)))
    }
}

/// SHA-256 hex over the canonical (sorted-key) JSON of a payload.
pub fn payload_checksum(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionPayload {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlivePayload {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorPayload {
    pub coordinator_id: NodeId,
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequestPayload {
    pub txn_id: String,
    pub statement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparePayload {
    pub txn_id: String,
    pub statement: String,
}

/// A participant's answer to PREPARE. `Timeout` is assigned by the
/// coordinator to votes that never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Yes,
    No,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotePayload {
    pub txn_id: String,
    pub vote: Vote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub txn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortPayload {
    pub txn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub txn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteReadPayload {
    pub txn_id: String,
    pub statement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResultPayload {
    pub txn_id: String,
    pub ok: bool,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnStatusPayload {
    pub txn_id: String,
}

/// Coordinator-reported outcome of a transaction queried for recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnOutcome {
    Committed,
    Aborted,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnStatusReplyPayload {
    pub txn_id: String,
    pub outcome: TxnOutcome,
}

// ---------------------------------------------------------------------------
// Client surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    pub message: String,
}

/// Reply object returned to clients; also the CLIENT_REPLY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientReply {
    pub ok: bool,
    pub txn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
    pub node_id: NodeId,
}

impl ClientReply {
    pub fn write_ok(txn_id: String, node_id: NodeId, affected_rows: u64) -> Self {
        ClientReply {
            ok: true,
            txn_id,
            affected_rows: Some(affected_rows),
            rows: None,
            error: None,
            node_id,
        }
    }

    pub fn read_ok(txn_id: String, node_id: NodeId, rows: Vec<Vec<String>>) -> Self {
        ClientReply {
            ok: true,
            txn_id,
            affected_rows: None,
            rows: Some(rows),
            error: None,
            node_id,
        }
    }

    pub fn failure(
        txn_id: String,
        node_id: NodeId,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        ClientReply {
            ok: false,
            txn_id,
            affected_rows: None,
            rows: None,
            error: Some(ReplyError {
                code,
                message: message.into(),
            }),
            node_id,
        }
    }
}

/// Globally unique transaction id: `TXN-{epoch_ms}-{random}`.
pub fn generate_txn_id() -> String {
    format!(
        "TXN-{}-{:08x}",
        relaydb_core::txnlog::current_time_ms(),
        fastrand::u32(..)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_independent_of_key_order() {
        let a: Value = serde_json::json!({"txn_id": "t", "statement": "SELECT 1"});
        let b: Value = serde_json::json!({"statement": "SELECT 1", "txn_id": "t"});
        assert_eq!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let env = Envelope::new(
            1,
            MessageKind::Prepare,
            &PreparePayload {
                txn_id: "TXN-1-a".to_string(),
                statement: "INSERT INTO t (a) VALUES ('x')".to_string(),
            },
        )
        .unwrap();
        assert!(env.verify());

        let mut tampered = env.clone();
        tampered.payload["statement"] = Value::String("INSERT INTO t (a) VALUES ('y')".into());
        assert!(!tampered.verify());
    }

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&MessageKind::ExecuteRead).unwrap();
        assert_eq!(json, "\"EXECUTE_READ\"");
        let parsed: MessageKind = serde_json::from_str("\"TXN_STATUS_REPLY\"").unwrap();
        assert_eq!(parsed, MessageKind::TxnStatusReply);
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::new(2, MessageKind::Election, &ElectionPayload { term: 7 }).unwrap();
        let raw = serde_json::to_string(&env).unwrap();
        assert!(raw.contains("\"type\":\"ELECTION\""));
        let back: Envelope = serde_json::from_str(&raw).unwrap();
        assert!(back.verify());
        let payload: ElectionPayload = back.decode().unwrap();
        assert_eq!(payload.term, 7);
    }

    #[test]
    fn test_txn_id_shape() {
        let id = generate_txn_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "TXN");
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_client_reply_omits_empty_fields() {
        let reply = ClientReply::failure("t".into(), 1, ErrorCode::Aborted, "vote NO");
        let raw = serde_json::to_string(&reply).unwrap();
        assert!(!raw.contains("affected_rows"));
        assert!(raw.contains("\"code\":\"ABORTED\""));
    }
}
