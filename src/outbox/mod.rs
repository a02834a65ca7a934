pub mod persistence;
pub mod queue;

pub use persistence::{MemoryQueueStore, QueueStore, SqliteQueueStore};
pub use queue::OutboxManager;
