pub mod bootstrap;
pub mod chunks;
pub mod consumer;
pub mod mirror;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Topic identifiers are treated as opaque strings of the `"x.y.z"` shape.
pub type TopicId = String;

/// One entry of the ordered consensus log, in the mirror-node wire shape.
/// The `message` field travels base64 on the wire and is decoded on arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMessage {
    pub sequence_number: u64,
    pub consensus_timestamp: String,
    #[serde(rename = "message", with = "base64_bytes")]
    pub payload: Vec<u8>,
    #[serde(rename = "payer_account_id", default)]
    pub payer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_info: Option<ChunkInfo>,
}

/// Present when a payload was split across consecutive log entries. Parts of
/// one group share the `transaction_valid_start` of the group's first part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    #[serde(default)]
    pub initial_transaction_id: Option<InitialTransactionId>,
    pub number: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialTransactionId {
    #[serde(default)]
    pub account_id: Option<String>,
    pub transaction_valid_start: String,
}

impl ChunkInfo {
    pub fn group_id(&self) -> Option<&str> {
        self.initial_transaction_id
            .as_ref()
            .map(|id| id.transaction_valid_start.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log request failed: {0}")]
    Transport(String),
    #[error("log request timed out")]
    Timeout,
    #[error("unexpected log substrate status {0}")]
    Status(u16),
    #[error("could not decode log substrate response: {0}")]
    Decode(String),
    #[error("no submit gateway configured, cannot publish")]
    SubmitUnavailable,
}

/// The narrow seam to the consensus-log substrate. Everything the admission
/// pipeline needs from it: an existence probe, ordered reads, a single-message
/// probe for bootstrap, and publication.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, LogError>;

    /// Messages with `sequence_number > after`, ascending, at most `limit`.
    async fn messages_after(
        &self,
        topic: &str,
        after: u64,
        limit: u32,
    ) -> Result<Vec<TopicMessage>, LogError>;

    /// The message at exactly `seq`, or `None` when the substrate reports it
    /// absent (HTTP 404).
    async fn message_at(&self, topic: &str, seq: u64) -> Result<Option<TopicMessage>, LogError>;

    /// Publishes `payload` and returns its assigned sequence number.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<u64, LogError>;

    async fn create_topic(&self) -> Result<TopicId, LogError>;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
