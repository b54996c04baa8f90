//! Bandlink wire protocol: tags, constants and message types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tag reserved for the liveness handshake.
pub const HANDSHAKE_TAG: &str = "__hs__";

/// Tag carrying file-transfer messages in both directions.
pub const FILE_TAG: &str = "file";

/// Byte size used to decide how many chunks a file is split into.
pub const CHUNK_BYTES: u64 = 20 * 1024; // 20 KiB

/// Device storage quota; a `ready` reporting more usage than this aborts the transfer.
pub const STORAGE_QUOTA: u64 = 25 * 1024 * 1024; // 25 MiB

/// Highest handshake count; receiving it ends the exchange.
pub const HANDSHAKE_FINAL_COUNT: u8 = 2;

/// Handshake payload. The exchange runs 0 -> 1 -> 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub count: u8,
}

impl HandshakeMessage {
    pub fn hello() -> Self {
        Self { count: 0 }
    }

    /// Echo-and-increment: the reply to this message, if the exchange continues.
    pub fn reply(self) -> Option<Self> {
        (self.count < HANDSHAKE_FINAL_COUNT).then(|| Self {
            count: self.count + 1,
        })
    }
}

/// Messages sent to the device on the file tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stat")]
pub enum FileCommand {
    /// Announce a transfer: display name, chunk count and the byte chunk size.
    #[serde(rename = "startTransfer")]
    StartTransfer {
        filename: String,
        total: u64,
        #[serde(rename = "chunkSize")]
        chunk_size: u64,
    },
    /// One chunk of text. `set_count` is present only when resending after a resume.
    #[serde(rename = "d")]
    Data {
        count: u64,
        data: String,
        #[serde(rename = "setCount")]
        set_count: Option<u64>,
    },
    #[serde(rename = "cancel")]
    Cancel,
}

/// Messages received from the device on the file tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceMessage {
    /// Device is ready. `length` is the text it already holds for this file, if any.
    Ready {
        #[serde(default)]
        found: bool,
        #[serde(default)]
        usage: u64,
        #[serde(default)]
        length: Option<i64>,
    },
    /// Device rejected a chunk and asks for `count` again.
    Error {
        #[serde(default)]
        message: String,
        count: u64,
    },
    Success {
        #[serde(default)]
        message: String,
        #[serde(default)]
        count: u64,
    },
    /// Device stored a chunk and asks for `count` next.
    Next {
        #[serde(default)]
        message: String,
        count: u64,
    },
    Cancel,
}

const DEVICE_MESSAGE_TYPES: [&str; 5] = ["ready", "error", "success", "next", "cancel"];

impl DeviceMessage {
    /// Parse envelope fields. `Ok(None)` for a well-formed message of a type this side does not know.
    pub fn parse(fields: &Map<String, Value>) -> Result<Option<Self>, ProtocolError> {
        let kind = match fields.get("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        if !DEVICE_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Ok(None);
        }
        serde_json::from_value(Value::Object(fields.clone()))
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Inbound transfer message that cannot be interpreted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("message has no type")]
    MissingType,
    #[error("malformed message: {0}")]
    Malformed(String),
}
