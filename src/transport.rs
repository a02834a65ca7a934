use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Attachment, MessageId};

/// Server acknowledgement for a delivered message. The echoed attachments,
/// when present, replace the local descriptors (the server may rewrite uris).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadAck {
    pub message_ids: Vec<MessageId>,
    pub read_at: DateTime<Utc>,
}

/// Collaborator failures the outbox distinguishes. Anything a transport
/// cannot classify should surface as `Network` so it stays retryable.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by server: {0}")]
    Validation(String),
}

/// Network seam the engine drives. Implementations own timeouts; the engine
/// treats a timeout like any other network failure.
///
/// `send_message` must be at-most-once per call: the engine does not
/// deduplicate server-side and relies on one logical attempt per invocation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        attachments: &[Attachment],
    ) -> Result<SentMessage, SendError>;

    /// Bulk read acknowledgement; idempotent server-side.
    async fn mark_read(
        &self,
        conversation_id: &str,
        message_ids: &[MessageId],
    ) -> Result<MarkReadAck, SendError>;
}

/// Reachability signal. `subscribe` callbacks fire on every transition; the
/// outbox uses the `true` edge to restart a deferred flush.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_reachable(&self) -> bool;

    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>);
}
