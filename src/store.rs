use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{
    BootstrapPage, ChatEvent, LocalSendState, Message, MessageId, OutboxItem, PaginationMeta,
    ReadReceipt,
};

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ConversationState {
    messages: HashMap<MessageId, Message>,
    meta: PaginationMeta,
    anchor: Option<MessageId>,
    unread_marker_cleared: bool,
}

/// Handle returned by [`MessageStore::subscribe`]; pass it back to
/// [`MessageStore::unsubscribe`] to stop notifications.
pub struct Subscription {
    conversation_id: String,
    token: u64,
}

/// In-memory, per-conversation message state. Single writer: every other
/// component reads it or goes through the mutators below, each of which
/// notifies subscribers exactly once and never exposes a torn intermediate.
pub struct MessageStore {
    local_user_id: String,
    inner: Mutex<HashMap<String, ConversationState>>,
    listeners: Mutex<HashMap<String, Vec<(u64, Listener)>>>,
    next_token: AtomicU64,
}

impl MessageStore {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            inner: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn subscribe(
        &self,
        conversation_id: &str,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners)
            .entry(conversation_id.to_string())
            .or_default()
            .push((token, Arc::new(listener)));

        Subscription {
            conversation_id: conversation_id.to_string(),
            token,
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(entries) = lock(&self.listeners).get_mut(&subscription.conversation_id) {
            entries.retain(|(token, _)| *token != subscription.token);
        }
    }

    /// Messages in display order: `created_at` ascending, id as tie-break.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let guard = lock(&self.inner);
        let Some(state) = guard.get(conversation_id) else {
            return Vec::new();
        };
        let mut messages: Vec<Message> = state.messages.values().cloned().collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        messages
    }

    pub fn message(&self, conversation_id: &str, id: MessageId) -> Option<Message> {
        lock(&self.inner)
            .get(conversation_id)
            .and_then(|state| state.messages.get(&id).cloned())
    }

    pub fn pagination_meta(&self, conversation_id: &str) -> PaginationMeta {
        lock(&self.inner)
            .get(conversation_id)
            .map(|state| state.meta.clone())
            .unwrap_or_default()
    }

    pub fn anchor(&self, conversation_id: &str) -> Option<MessageId> {
        lock(&self.inner)
            .get(conversation_id)
            .and_then(|state| state.anchor)
    }

    pub fn unread_marker_cleared(&self, conversation_id: &str) -> bool {
        lock(&self.inner)
            .get(conversation_id)
            .map(|state| state.unread_marker_cleared)
            .unwrap_or(false)
    }

    /// Replace the conversation window with the bootstrap page. Optimistic
    /// placeholders survive the replacement: they belong to the outbox, not
    /// to the server window.
    pub fn set_page(&self, conversation_id: &str, page: BootstrapPage) {
        {
            let mut guard = lock(&self.inner);
            let state = guard.entry(conversation_id.to_string()).or_default();
            state.messages.retain(|id, _| id.is_local());
            for message in page.messages {
                merge_message(state, message);
            }
            state.meta = PaginationMeta {
                has_more_before: page.has_more_before,
                prev_cursor: page.prev_cursor,
                has_more_after: page.has_more_after,
                next_cursor: page.next_cursor,
            };
            state.anchor = page.anchor_message_id;
            state.unread_marker_cleared = false;
        }
        self.notify(conversation_id);
    }

    /// Merge an older page fetched while scrolling back.
    pub fn prepend_page(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        prev_cursor: Option<String>,
        has_more_before: bool,
    ) {
        {
            let mut guard = lock(&self.inner);
            let state = guard.entry(conversation_id.to_string()).or_default();
            for message in messages {
                merge_message(state, message);
            }
            state.meta.prev_cursor = prev_cursor;
            state.meta.has_more_before = has_more_before;
        }
        self.notify(conversation_id);
    }

    /// Idempotency boundary for every inbound path (bootstrap, pagination,
    /// push events). Keyed by id; on replace, read state merges monotonically
    /// so a stale echo can never regress `read_by`.
    pub fn upsert_message(&self, message: Message) {
        let conversation_id = message.conversation_id.clone();
        {
            let mut guard = lock(&self.inner);
            let state = guard.entry(conversation_id.clone()).or_default();
            merge_message(state, message);
        }
        self.notify(&conversation_id);
    }

    /// Apply an in-place patch. Returns false (and stays silent) when the
    /// message is unknown.
    pub fn update_message(
        &self,
        conversation_id: &str,
        id: MessageId,
        patch: impl FnOnce(&mut Message),
    ) -> bool {
        let patched = {
            let mut guard = lock(&self.inner);
            match guard
                .get_mut(conversation_id)
                .and_then(|state| state.messages.get_mut(&id))
            {
                Some(message) => {
                    patch(message);
                    true
                }
                None => false,
            }
        };
        if patched {
            self.notify(conversation_id);
        }
        patched
    }

    pub fn remove_message(&self, conversation_id: &str, id: MessageId) -> bool {
        let removed = {
            let mut guard = lock(&self.inner);
            guard
                .get_mut(conversation_id)
                .map(|state| state.messages.remove(&id).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.notify(conversation_id);
        }
        removed
    }

    /// Add a `(user, read_at)` pair to each named message. Re-adding an
    /// existing pair is a no-op; a local-user receipt also advances the
    /// conversation's unread marker.
    pub fn apply_read_receipts(
        &self,
        conversation_id: &str,
        message_ids: &[MessageId],
        user_id: &str,
        read_at: DateTime<Utc>,
    ) {
        {
            let mut guard = lock(&self.inner);
            let state = guard.entry(conversation_id.to_string()).or_default();
            for id in message_ids {
                if let Some(message) = state.messages.get_mut(id) {
                    if !message.is_read_by(user_id) {
                        message.read_by.push(ReadReceipt {
                            user_id: user_id.to_string(),
                            read_at,
                        });
                    }
                }
            }
            if user_id == self.local_user_id {
                state.unread_marker_cleared = true;
            }
        }
        self.notify(conversation_id);
    }

    /// Insert the optimistic record for a freshly enqueued (or restored)
    /// outbox item.
    pub fn insert_placeholder(&self, item: &OutboxItem) {
        let local_state = match item.status {
            crate::domain::OutboxStatus::Pending => LocalSendState::Pending,
            crate::domain::OutboxStatus::Failed => LocalSendState::Failed,
        };
        self.upsert_message(Message {
            id: item.local_id(),
            conversation_id: item.conversation_id.clone(),
            text: item.text.clone(),
            attachments: item.attachments.clone(),
            sender: item.sender.clone(),
            created_at: item.created_at,
            edited_at: None,
            read_by: Vec::new(),
            local_state: Some(local_state),
            send_error: item.last_error.clone(),
        });
    }

    /// Mirror the owning outbox item's state onto its placeholder.
    pub fn set_placeholder_state(
        &self,
        conversation_id: &str,
        local_message_id: u64,
        state: LocalSendState,
        error: Option<String>,
    ) {
        self.update_message(
            conversation_id,
            MessageId::Local(local_message_id),
            |message| {
                message.local_state = Some(state);
                message.send_error = error;
            },
        );
    }

    /// Swap the placeholder for the authoritative record in one observable
    /// update: subscribers never see zero or two records for the message.
    pub fn complete_placeholder(
        &self,
        conversation_id: &str,
        local_message_id: u64,
        authoritative: Message,
    ) {
        {
            let mut guard = lock(&self.inner);
            let state = guard.entry(conversation_id.to_string()).or_default();
            state.messages.remove(&MessageId::Local(local_message_id));
            merge_message(state, authoritative);
        }
        self.notify(conversation_id);
    }

    /// Merge one real-time feed event.
    pub fn apply_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::MessageAdded { message } => self.upsert_message(message),
            ChatEvent::MessageEdited {
                conversation_id,
                id,
                text,
                edited_at,
            } => {
                // Last-write-wins; concurrent edits are not merged.
                self.update_message(&conversation_id, id, |message| {
                    message.text = text;
                    message.edited_at = Some(edited_at);
                });
            }
            ChatEvent::MessageDeleted {
                conversation_id,
                id,
            } => {
                self.remove_message(&conversation_id, id);
            }
            ChatEvent::MessageRead {
                conversation_id,
                message_ids,
                user_id,
                read_at,
            } => {
                self.apply_read_receipts(&conversation_id, &message_ids, &user_id, read_at);
            }
        }
    }

    fn notify(&self, conversation_id: &str) {
        let listeners: Vec<Listener> = lock(&self.listeners)
            .get(conversation_id)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        debug!(
            component = "store",
            conversation_id,
            subscribers = listeners.len(),
            "store changed"
        );
        for listener in listeners {
            listener();
        }
    }
}

/// Insert-or-replace keyed by id, preserving read entries the incoming
/// record does not carry.
fn merge_message(state: &mut ConversationState, mut incoming: Message) {
    if let Some(existing) = state.messages.get(&incoming.id) {
        for entry in &existing.read_by {
            if !incoming.is_read_by(&entry.user_id) {
                incoming.read_by.push(entry.clone());
            }
        }
    }
    state.messages.insert(incoming.id, incoming);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::testutil::{authoritative_message, bootstrap_page, outbox_item};

    #[test]
    fn upsert_is_idempotent_and_keyed_by_id() {
        let store = MessageStore::new("me");
        let message = authoritative_message("conv", 7, "hello");

        store.upsert_message(message.clone());
        store.upsert_message(message.clone());

        let messages = store.messages("conv");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Remote(7));
    }

    #[test]
    fn upsert_never_regresses_read_state() {
        let store = MessageStore::new("me");
        let mut message = authoritative_message("conv", 7, "hello");
        store.upsert_message(message.clone());
        store.apply_read_receipts("conv", &[MessageId::Remote(7)], "other", Utc::now());

        // A stale echo without read entries arrives again.
        message.read_by.clear();
        store.upsert_message(message);

        let stored = store.message("conv", MessageId::Remote(7)).expect("message");
        assert!(stored.is_read_by("other"));
    }

    #[test]
    fn read_receipts_are_idempotent() {
        let store = MessageStore::new("me");
        store.upsert_message(authoritative_message("conv", 3, "hi"));

        let at = Utc::now();
        store.apply_read_receipts("conv", &[MessageId::Remote(3)], "u2", at);
        store.apply_read_receipts("conv", &[MessageId::Remote(3)], "u2", at);

        let stored = store.message("conv", MessageId::Remote(3)).expect("message");
        assert_eq!(stored.read_by.len(), 1);
    }

    #[test]
    fn local_user_receipt_advances_unread_marker() {
        let store = MessageStore::new("me");
        store.upsert_message(authoritative_message("conv", 3, "hi"));
        assert!(!store.unread_marker_cleared("conv"));

        store.apply_read_receipts("conv", &[MessageId::Remote(3)], "me", Utc::now());
        assert!(store.unread_marker_cleared("conv"));
    }

    #[test]
    fn set_page_preserves_optimistic_placeholders() {
        let store = MessageStore::new("me");
        store.insert_placeholder(&outbox_item("conv", 1, "draft"));
        store.upsert_message(authoritative_message("conv", 99, "stale"));

        store.set_page(
            "conv",
            bootstrap_page(vec![authoritative_message("conv", 1, "first")], None),
        );

        let messages = store.messages("conv");
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        assert!(ids.contains(&MessageId::Local(1)));
        assert!(ids.contains(&MessageId::Remote(1)));
        assert!(!ids.contains(&MessageId::Remote(99)));
    }

    #[test]
    fn complete_placeholder_swaps_in_one_notification() {
        let store = Arc::new(MessageStore::new("me"));
        store.insert_placeholder(&outbox_item("conv", 4, "out"));

        let torn = Arc::new(AtomicUsize::new(0));
        let notifications = Arc::new(AtomicUsize::new(0));
        let sub = {
            let reader = Arc::clone(&store);
            let torn = Arc::clone(&torn);
            let notifications = Arc::clone(&notifications);
            store.subscribe("conv", move || {
                notifications.fetch_add(1, Ordering::SeqCst);
                let count = reader
                    .messages("conv")
                    .iter()
                    .filter(|m| m.text == "out")
                    .count();
                if count != 1 {
                    torn.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        store.complete_placeholder("conv", 4, authoritative_message("conv", 42, "out"));

        assert_eq!(notifications.load(Ordering::SeqCst), 1);
        assert_eq!(torn.load(Ordering::SeqCst), 0);
        assert!(store.message("conv", MessageId::Local(4)).is_none());
        assert!(store.message("conv", MessageId::Remote(42)).is_some());
        store.unsubscribe(&sub);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = MessageStore::new("me");
        let fired = Arc::new(AtomicUsize::new(0));
        let sub = {
            let fired = Arc::clone(&fired);
            store.subscribe("conv", move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        store.upsert_message(authoritative_message("conv", 1, "a"));
        store.unsubscribe(&sub);
        store.upsert_message(authoritative_message("conv", 2, "b"));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn messages_are_ordered_by_time() {
        let store = MessageStore::new("me");
        let mut early = authoritative_message("conv", 2, "early");
        early.created_at = Utc::now() - chrono::Duration::minutes(5);
        let late = authoritative_message("conv", 1, "late");

        store.upsert_message(late);
        store.upsert_message(early);

        let texts: Vec<String> = store
            .messages("conv")
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["early".to_string(), "late".to_string()]);
    }

    #[test]
    fn apply_event_edit_and_delete() {
        let store = MessageStore::new("me");
        store.upsert_message(authoritative_message("conv", 5, "original"));

        store.apply_event(ChatEvent::MessageEdited {
            conversation_id: "conv".into(),
            id: MessageId::Remote(5),
            text: "edited".into(),
            edited_at: Utc::now(),
        });
        let stored = store.message("conv", MessageId::Remote(5)).expect("message");
        assert_eq!(stored.text, "edited");
        assert!(stored.edited_at.is_some());

        store.apply_event(ChatEvent::MessageDeleted {
            conversation_id: "conv".into(),
            id: MessageId::Remote(5),
        });
        assert!(store.message("conv", MessageId::Remote(5)).is_none());
    }

    #[test]
    fn update_unknown_message_is_silent() {
        let store = MessageStore::new("me");
        let fired = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let fired = Arc::clone(&fired);
            store.subscribe("conv", move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        let patched = store.update_message("conv", MessageId::Remote(404), |m| {
            m.text = "nope".into();
        });
        assert!(!patched);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
