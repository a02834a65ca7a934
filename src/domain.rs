use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message identity. Optimistic records carry a session-local id until the
/// server acknowledges the send and assigns a remote one; the distinction is
/// part of the type rather than a sign convention on a raw integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    Local(u64),
    Remote(u64),
}

impl MessageId {
    pub fn is_local(self) -> bool {
        matches!(self, MessageId::Local(_))
    }

    pub fn is_remote(self) -> bool {
        matches!(self, MessageId::Remote(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Local(id) => write!(f, "local:{id}"),
            MessageId::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

/// Minimal sender descriptor captured at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub uri: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// One `(user, read_at)` pair in a message's read set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalSendState {
    Pending,
    Failed,
}

impl LocalSendState {
    pub fn as_str(self) -> &'static str {
        match self {
            LocalSendState::Pending => "pending",
            LocalSendState::Failed => "failed",
        }
    }
}

/// One conversation message as the store holds it. Authoritative records have
/// a `Remote` id and no `local_state`; optimistic records have a `Local` id
/// and mirror the owning outbox item's state until the swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub sender: UserRef,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_state: Option<LocalSendState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub send_error: Option<String>,
}

impl Message {
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|entry| entry.user_id == user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// One pending or failed outgoing message, as persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: String,
    pub conversation_id: String,
    pub local_message_id: u64,
    pub sender: UserRef,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxItem {
    pub fn local_id(&self) -> MessageId {
        MessageId::Local(self.local_message_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub has_more_before: bool,
    pub prev_cursor: Option<String>,
    pub has_more_after: bool,
    pub next_cursor: Option<String>,
}

/// Initial page for a conversation open, as supplied by the bootstrap
/// collaborator. `anchor_message_id` is the server-designated first unread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPage {
    pub messages: Vec<Message>,
    pub has_more_before: bool,
    pub prev_cursor: Option<String>,
    pub has_more_after: bool,
    pub next_cursor: Option<String>,
    pub anchor_message_id: Option<MessageId>,
}

/// Real-time feed events the store merges through its mutators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    MessageAdded {
        message: Message,
    },
    MessageEdited {
        conversation_id: String,
        id: MessageId,
        text: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        conversation_id: String,
        id: MessageId,
    },
    MessageRead {
        conversation_id: String,
        message_ids: Vec<MessageId>,
        user_id: String,
        read_at: DateTime<Utc>,
    },
}
