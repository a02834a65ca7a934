//! Offline-first synchronization engine for the appeals chat feature.
//!
//! The engine owns four cooperating parts: a durable outbox queue that
//! retries sends with capped exponential backoff, an in-memory message store
//! the UI renders from, a debounced read-receipt batcher, and the
//! initial-position resolver that decides where a freshly opened conversation
//! scrolls to. Transport, connectivity, and the rendering layer are
//! collaborators supplied by the embedding application.

pub mod backoff;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod observability;
pub mod outbox;
pub mod position;
pub mod receipts;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use config::SyncConfig;
pub use domain::{
    Attachment, BootstrapPage, ChatEvent, LocalSendState, Message, MessageId, OutboxItem,
    OutboxStatus, PaginationMeta, ReadReceipt, UserRef,
};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use outbox::{MemoryQueueStore, OutboxManager, QueueStore, SqliteQueueStore};
pub use position::{PositionPhase, ScrollTarget};
pub use store::{MessageStore, Subscription};
pub use transport::{ChatTransport, ConnectivityMonitor, MarkReadAck, SendError, SentMessage};
