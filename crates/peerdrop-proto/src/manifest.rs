//! End-of-transfer control message.

use serde::{Deserialize, Serialize};

/// Sent as the channel's UTF-8 control payload after the last chunk frame.
///
/// Signals the receiver to finalize reassembly. Field names match the wire
/// format: `{"done":true,"fileName":"...","totalSize":N}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    pub done: bool,
    pub file_name: String,
    /// Total plaintext size in bytes.
    pub total_size: u64,
}

impl TransferManifest {
    /// Encode as the channel control payload.
    pub fn to_control(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from a channel control payload.
    pub fn from_control(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
