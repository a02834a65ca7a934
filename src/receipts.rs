use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::MessageId;
use crate::store::MessageStore;
use crate::transport::ChatTransport;

#[derive(Default)]
struct ConversationReceipts {
    pending: HashSet<MessageId>,
    ready: bool,
    interacted: bool,
    at_latest: bool,
    in_flight: bool,
    timer: Option<JoinHandle<()>>,
}

impl ConversationReceipts {
    /// Receipts may flow only once the position resolver settled AND the
    /// user either interacted or the view already sits at the newest
    /// message. Anything observed earlier was just initial-positioning
    /// noise.
    fn armed(&self) -> bool {
        self.ready && (self.interacted || self.at_latest)
    }
}

/// Accumulates "seen" message ids per conversation and flushes them as one
/// bulk acknowledgement after a quiet debounce window.
pub struct ReadReceiptBatcher {
    store: Arc<MessageStore>,
    transport: Arc<dyn ChatTransport>,
    debounce: Duration,
    state: Mutex<HashMap<String, ConversationReceipts>>,
    weak_self: Weak<ReadReceiptBatcher>,
}

impl ReadReceiptBatcher {
    pub fn new(
        debounce: Duration,
        store: Arc<MessageStore>,
        transport: Arc<dyn ChatTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            transport,
            debounce,
            state: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    /// Reset the arming gates for a fresh conversation open. Unflushed ids
    /// from the previous session stay pending; nothing is discarded.
    pub fn begin_session(&self, conversation_id: &str) {
        let mut state = self.lock_state();
        let entry = state.entry(conversation_id.to_string()).or_default();
        entry.ready = false;
        entry.interacted = false;
        entry.at_latest = false;
    }

    pub fn set_ready(&self, conversation_id: &str) {
        self.lock_state()
            .entry(conversation_id.to_string())
            .or_default()
            .ready = true;
    }

    pub fn note_interaction(&self, conversation_id: &str) {
        self.lock_state()
            .entry(conversation_id.to_string())
            .or_default()
            .interacted = true;
    }

    pub fn set_at_latest(&self, conversation_id: &str, at_latest: bool) {
        self.lock_state()
            .entry(conversation_id.to_string())
            .or_default()
            .at_latest = at_latest;
    }

    pub fn is_armed(&self, conversation_id: &str) -> bool {
        self.lock_state()
            .get(conversation_id)
            .map(ConversationReceipts::armed)
            .unwrap_or(false)
    }

    /// Called by the rendering layer whenever the on-screen id set changes.
    /// A no-op until armed; once armed, own messages and messages the local
    /// user already read are filtered out and the rest (re)start the
    /// debounce window.
    pub fn observe_visible(&self, conversation_id: &str, visible: &[MessageId]) {
        if !self.is_armed(conversation_id) {
            debug!(
                component = "receipts",
                conversation_id, "visibility before arming ignored"
            );
            return;
        }

        let local_user = self.store.local_user_id().to_string();
        let fresh: Vec<MessageId> = visible
            .iter()
            .copied()
            .filter(|id| {
                self.store
                    .message(conversation_id, *id)
                    .map(|m| m.sender.id != local_user && !m.is_read_by(&local_user))
                    .unwrap_or(false)
            })
            .collect();
        if fresh.is_empty() {
            return;
        }

        {
            let mut state = self.lock_state();
            let entry = state.entry(conversation_id.to_string()).or_default();
            entry.pending.extend(fresh);
        }
        self.arm_debounce(conversation_id);
    }

    /// Flush without waiting for the debounce window (conversation close).
    pub async fn flush_now(&self, conversation_id: &str) {
        if let Some(entry) = self.lock_state().get_mut(conversation_id) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
        self.flush_pending(conversation_id).await;
    }

    /// One in-flight request per conversation; ids observed mid-flight wait
    /// for the next window, and a failed flush keeps everything pending.
    async fn flush_pending(&self, conversation_id: &str) {
        let batch: Vec<MessageId> = {
            let mut state = self.lock_state();
            let Some(entry) = state.get_mut(conversation_id) else {
                return;
            };
            if entry.in_flight || entry.pending.is_empty() {
                return;
            }
            entry.in_flight = true;
            entry.pending.iter().copied().collect()
        };

        match self.transport.mark_read(conversation_id, &batch).await {
            Ok(ack) => {
                debug!(
                    component = "receipts",
                    conversation_id,
                    acknowledged = ack.message_ids.len(),
                    "read receipts flushed"
                );
                self.store.apply_read_receipts(
                    conversation_id,
                    &ack.message_ids,
                    &self.store.local_user_id().to_string(),
                    ack.read_at,
                );
                let leftovers = {
                    let mut state = self.lock_state();
                    match state.get_mut(conversation_id) {
                        Some(entry) => {
                            for id in &ack.message_ids {
                                entry.pending.remove(id);
                            }
                            entry.in_flight = false;
                            !entry.pending.is_empty()
                        }
                        None => false,
                    }
                };
                if leftovers {
                    self.arm_debounce(conversation_id);
                }
            }
            Err(err) => {
                // Silent retry on the next observation or explicit flush.
                debug!(
                    component = "receipts",
                    conversation_id,
                    error = %err,
                    "read receipt flush failed, keeping ids pending"
                );
                if let Some(entry) = self.lock_state().get_mut(conversation_id) {
                    entry.in_flight = false;
                }
            }
        }
    }

    /// Replace the debounce timer; one live handle per conversation, always.
    fn arm_debounce(&self, conversation_id: &str) {
        let Some(batcher) = self.weak_self.upgrade() else {
            return;
        };
        let conversation = conversation_id.to_string();
        let debounce = self.debounce;
        // The handle only covers the sleep; the flush itself runs in a fresh
        // task so aborting a superseded timer cannot cancel an in-flight
        // flush.
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            tokio::spawn(async move {
                batcher.flush_pending(&conversation).await;
            });
        });

        let mut state = self.lock_state();
        let entry = state.entry(conversation_id.to_string()).or_default();
        if let Some(old) = entry.timer.replace(handle) {
            old.abort();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, ConversationReceipts>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
