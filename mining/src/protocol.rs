//! Stratum v1 line-delimited JSON-RPC wire types.
//!
//! Every line is either a request (client -> server, has an `id`), a
//! response (server -> client, echoes the request `id`), or a notification
//! (server -> client, `id` is `null`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use kps_core::StratumErrorCode;

/// An inbound line from the client. `id` is kept as `Value` since the spec
/// allows both numeric and string request IDs and we must echo it back
/// byte-for-byte.
#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: StratumErrorCode) -> Self {
        Self {
            id,
            result: None,
            error: Some(json!([code.code(), code.message(), Value::Null])),
        }
    }

    pub fn protocol_error(id: Value, message: &str) -> Self {
        Self {
            id,
            result: None,
            error: Some(json!([StratumErrorCode::Other.code(), message, Value::Null])),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("StratumResponse always serializes")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumNotification {
    pub id: Value,
    pub method: &'static str,
    pub params: Value,
}

impl StratumNotification {
    pub fn set_difficulty(diff: f64) -> Self {
        Self {
            id: Value::Null,
            method: "mining.set_difficulty",
            params: json!([diff]),
        }
    }

    /// `[jobIdHex, headerHashHex, seedHashHex, targetHex, cleanJobs]`.
    /// Unlike a Bitcoin-style pool this server has already folded the
    /// coinbase into the merkle root server-side, so there is no
    /// coinb1/coinb2 split or merkle branch list for the client to redo the
    /// work: the client only ever needs `headerHash`, `seedHash`, its own
    /// target (derived from its current difficulty, not the network
    /// target), and the nonce range. `target_hex` is the client's own
    /// target, little-endian hex, not `job.network_target`.
    pub fn notify(job: &kps_core::Job, target_hex: &str) -> Self {
        Self {
            id: Value::Null,
            method: "mining.notify",
            params: json!([
                job.id,
                hex::encode(job.header_hash),
                hex::encode(job.seed_hash),
                target_hex,
                job.is_new_block,
            ]),
        }
    }

    pub fn set_extranonce(extra_nonce1: &str, extra_nonce2_size: usize) -> Self {
        Self {
            id: Value::Null,
            method: "mining.set_extranonce",
            params: json!([extra_nonce1, extra_nonce2_size]),
        }
    }

    /// A polite shutdown notice sent to a client before its socket closes.
    pub fn show_message(message: &str) -> Self {
        Self {
            id: Value::Null,
            method: "client.show_message",
            params: json!([message]),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("StratumNotification always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_numeric_and_string_ids() {
        let numeric: StratumRequest =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":[]}"#).unwrap();
        assert_eq!(numeric.id, json!(1));

        let stringy: StratumRequest =
            serde_json::from_str(r#"{"id":"abc","method":"mining.subscribe","params":[]}"#).unwrap();
        assert_eq!(stringy.id, json!("abc"));
    }

    #[test]
    fn error_response_uses_reserved_code_and_message() {
        let resp = StratumResponse::error(json!(1), StratumErrorCode::DuplicateShare);
        let line = resp.to_line();
        assert!(line.contains("22"));
        assert!(line.contains("Duplicate share"));
    }
}
