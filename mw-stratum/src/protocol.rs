//! The stratum line protocol: one JSON object per `\n`-terminated line.
//!
//! Method strings are `login`, `job`, `solution`, `result` and `cancel`.
//! Unknown methods parse to `None` so the server can log and ignore them
//! without tearing the connection down.

use serde::{Deserialize, Serialize};

use crate::error::StratumError;

/// Login was rejected; the server closes the stream after replying.
pub const LOGIN_FAILED: i32 = -32003;
/// The submitted solution did not validate.
pub const SOLUTION_REJECTED: i32 = -32006;
/// The submitted solution was accepted into a block.
pub const SOLUTION_ACCEPTED: i32 = 1;

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum Message {
    /// Miner authenticates with its API key.
    Login { id: String, api_key: String },
    /// Server hands out a proof-of-work job.
    Job {
        id: String,
        /// Hex-encoded hash the miner works on.
        input: String,
        /// Difficulty-encoded proof-of-work header.
        difficulty: u32,
        height: u64,
    },
    /// Miner submits a solution for a job.
    Solution {
        id: String,
        /// Hex-encoded nonce.
        nonce: String,
        /// Hex-encoded proof-of-work output.
        output: String,
    },
    /// Server-side verdict, also used for login failures.
    Result {
        id: String,
        code: i32,
        description: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        blockhash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        height: Option<u64>,
    },
    /// Server cancels an outstanding job.
    Cancel { id: String },
}

impl Message {
    pub fn login_failed(id: String) -> Self {
        Message::Result {
            id,
            code: LOGIN_FAILED,
            description: "login failed".into(),
            blockhash: None,
            height: None,
        }
    }

    pub fn solution_rejected(id: String) -> Self {
        Message::Result {
            id,
            code: SOLUTION_REJECTED,
            description: "solution rejected".into(),
            blockhash: None,
            height: None,
        }
    }

    pub fn solution_accepted(id: String, blockhash: String, height: u64) -> Self {
        Message::Result {
            id,
            code: SOLUTION_ACCEPTED,
            description: "solution accepted".into(),
            blockhash: Some(blockhash),
            height: Some(height),
        }
    }
}

/// Serialize one frame, newline-terminated.
pub fn encode(msg: &Message) -> String {
    let mut line = serde_json::to_string(msg).expect("protocol frames always serialize");
    line.push('\n');
    line
}

/// Parse one line.
///
/// `Ok(None)` means the frame was well-formed JSON carrying an unknown or
/// unsupported method; the caller logs and ignores it. Malformed JSON is
/// an error and drops the peer.
pub fn parse(line: &str) -> Result<Option<Message>, StratumError> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| StratumError::Protocol(format!("malformed frame: {e}")))?;

    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    if !matches!(method.as_str(), "login" | "job" | "solution" | "result" | "cancel") {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StratumError::Protocol(format!("invalid {method} frame: {e}")))
}
