//! Messages exchanged over the peer data channel.
//!
//! Every frame is a JSON object `{"type": ..., "payload": ...}`. Only the
//! `file` type is handled here; chat and status frames share the channel but
//! belong to other layers, so [`WireMessage::decode`] reports them as `None`.

use serde::{Deserialize, Serialize};

/// Envelope for all data-channel traffic handled by PeerLink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum WireMessage {
    File(FileMessage),
}

/// File-transfer control messages, discriminated by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileMessage {
    Start(StartPayload),
    Chunk(ChunkPayload),
    Complete(CompletePayload),
}

/// Announces a new transfer. Carries metadata and the exported key, never
/// file bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
    /// SHA-256 hex digest of the plaintext file.
    pub checksum: String,
    /// Base64 raw AES-256 key.
    pub key: String,
}

/// One encrypted chunk.
///
/// `data` and `iv` are base64-encoded in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub id: String,
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
}

/// Signals that every chunk of a transfer has been sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub id: String,
}

impl FileMessage {
    /// Transfer id the message refers to.
    pub fn transfer_id(&self) -> &str {
        match self {
            FileMessage::Start(p) => &p.id,
            FileMessage::Chunk(p) => &p.id,
            FileMessage::Complete(p) => &p.id,
        }
    }

    /// Short name of the action, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            FileMessage::Start(_) => "start",
            FileMessage::Chunk(_) => "chunk",
            FileMessage::Complete(_) => "complete",
        }
    }
}

impl WireMessage {
    /// Serializes the message to its JSON frame.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a JSON frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of a type this crate does not
    /// handle (`chat`, `status`, ...). Malformed JSON or a malformed `file`
    /// payload is an error.
    pub fn decode(frame: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_slice(frame)?;
        let is_file = value.get("type").and_then(|t| t.as_str()) == Some("file");
        if !is_file {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }
}

impl From<FileMessage> for WireMessage {
    fn from(msg: FileMessage) -> Self {
        WireMessage::File(msg)
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
