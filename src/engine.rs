use std::sync::Arc;

use tracing::debug;

use crate::config::SyncConfig;
use crate::domain::{
    Attachment, BootstrapPage, ChatEvent, Message, MessageId, OutboxItem, PaginationMeta, UserRef,
};
use crate::error::SyncError;
use crate::outbox::{OutboxManager, QueueStore};
use crate::position::{PositionPhase, PositionResolver, ScrollTarget};
use crate::receipts::ReadReceiptBatcher;
use crate::store::{MessageStore, Subscription};
use crate::transport::{ChatTransport, ConnectivityMonitor};

/// Facade wiring the store, outbox, read-receipt batcher, and position
/// resolver over caller-supplied collaborators. Construct one per process
/// and hand it to the UI layer; everything here is cheap to call from the
/// event loop.
pub struct SyncEngine {
    local_user: UserRef,
    store: Arc<MessageStore>,
    outbox: Arc<OutboxManager>,
    receipts: Arc<ReadReceiptBatcher>,
    resolver: Arc<PositionResolver>,
}

impl SyncEngine {
    pub async fn new(
        config: SyncConfig,
        local_user: UserRef,
        transport: Arc<dyn ChatTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        queue_store: Arc<dyn QueueStore>,
    ) -> Arc<Self> {
        let store = Arc::new(MessageStore::new(local_user.id.clone()));
        let outbox = OutboxManager::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&connectivity),
            queue_store,
        );
        outbox.restore().await;
        {
            let outbox = Arc::clone(&outbox);
            connectivity.subscribe(Box::new(move |reachable| {
                if reachable {
                    outbox.spawn_flush();
                }
            }));
        }

        let receipts = ReadReceiptBatcher::new(
            config.read_debounce,
            Arc::clone(&store),
            Arc::clone(&transport),
        );
        let resolver = PositionResolver::new(
            config.anchor_settle_timeout,
            config.anchor_viewport_fraction,
            Arc::clone(&store),
        );
        {
            let receipts = Arc::clone(&receipts);
            resolver.on_ready(move |conversation_id| receipts.set_ready(conversation_id));
        }

        debug!(component = "engine", user_id = %local_user.id, "sync engine constructed");
        Arc::new(Self {
            local_user,
            store,
            outbox,
            receipts,
            resolver,
        })
    }

    // --- conversation lifecycle ---

    /// Apply the bootstrap page and compute the initial scroll target. The
    /// renderer applies the target and reports back via
    /// [`confirm_position`](Self::confirm_position).
    pub fn open_conversation(&self, conversation_id: &str, page: BootstrapPage) -> ScrollTarget {
        self.resolver.begin(conversation_id);
        self.receipts.begin_session(conversation_id);
        self.store.set_page(conversation_id, page);
        self.resolver.resolve(conversation_id)
    }

    /// Flush any receipts still pending before the conversation goes away.
    pub async fn close_conversation(&self, conversation_id: &str) {
        self.receipts.flush_now(conversation_id).await;
    }

    pub fn prepend_page(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        prev_cursor: Option<String>,
        has_more_before: bool,
    ) {
        self.store
            .prepend_page(conversation_id, messages, prev_cursor, has_more_before);
    }

    // --- sending ---

    pub async fn enqueue_message(
        &self,
        conversation_id: &str,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Result<OutboxItem, SyncError> {
        self.outbox
            .enqueue(conversation_id, self.local_user.clone(), text, attachments)
            .await
    }

    pub async fn retry_outbox_item(&self, outbox_id: &str) {
        self.outbox.retry_now(outbox_id).await;
    }

    pub async fn cancel_outbox_item(&self, outbox_id: &str) -> bool {
        self.outbox.cancel(outbox_id).await
    }

    pub fn outbox_snapshot(&self) -> Vec<OutboxItem> {
        self.outbox.snapshot()
    }

    // --- reading ---

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.messages(conversation_id)
    }

    pub fn pagination_meta(&self, conversation_id: &str) -> PaginationMeta {
        self.store.pagination_meta(conversation_id)
    }

    pub fn subscribe_messages(
        &self,
        conversation_id: &str,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        self.store.subscribe(conversation_id, listener)
    }

    pub fn unsubscribe_messages(&self, subscription: &Subscription) {
        self.store.unsubscribe(subscription);
    }

    // --- rendering-layer signals ---

    pub fn observe_visible_message_ids(&self, conversation_id: &str, visible: &[MessageId]) {
        self.receipts.observe_visible(conversation_id, visible);
    }

    pub fn notify_user_interaction(&self, conversation_id: &str) {
        self.receipts.note_interaction(conversation_id);
    }

    pub fn set_scrolled_to_latest(&self, conversation_id: &str, at_latest: bool) {
        self.receipts.set_at_latest(conversation_id, at_latest);
    }

    pub fn confirm_position(
        &self,
        conversation_id: &str,
        anchor_visible: bool,
    ) -> Option<ScrollTarget> {
        self.resolver.confirm(conversation_id, anchor_visible)
    }

    pub fn position_phase(&self, conversation_id: &str) -> PositionPhase {
        self.resolver.phase(conversation_id)
    }

    /// Fired once per conversation-open, when positioning settles.
    pub fn on_initial_positioned(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.resolver.on_ready(listener);
    }

    // --- real-time feed ---

    pub fn apply_event(&self, event: ChatEvent) {
        self.store.apply_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::domain::LocalSendState;
    use crate::outbox::MemoryQueueStore;
    use crate::testutil::{
        authoritative_message, bootstrap_page, user, wait_until, FakeConnectivity, FakeTransport,
    };

    struct Harness {
        engine: Arc<SyncEngine>,
        transport: Arc<FakeTransport>,
        connectivity: Arc<FakeConnectivity>,
    }

    async fn engine(reachable: bool) -> Harness {
        let mut config = SyncConfig::default();
        config.read_debounce = Duration::from_millis(30);
        config.backoff = BackoffConfig {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(120),
        };

        let transport = Arc::new(FakeTransport::new());
        let connectivity = Arc::new(FakeConnectivity::new(reachable));
        let transport_dyn: Arc<dyn ChatTransport> = transport.clone();
        let connectivity_dyn: Arc<dyn ConnectivityMonitor> = connectivity.clone();
        let queue_store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        let engine = SyncEngine::new(config, user("me"), transport_dyn, connectivity_dyn, queue_store)
            .await;

        Harness {
            engine,
            transport,
            connectivity,
        }
    }

    #[tokio::test]
    async fn offline_send_delivers_exactly_once_on_regain() {
        let h = engine(false).await;
        let item = h
            .engine
            .enqueue_message("conv", "hello".into(), Vec::new())
            .await
            .expect("enqueue");

        // Optimistic record immediately, no network traffic while offline.
        let messages = h.engine.messages("conv");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].local_state, Some(LocalSendState::Pending));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.transport.send_calls().is_empty());

        h.connectivity.set_reachable(true);
        let e = Arc::clone(&h.engine);
        let local_id = item.local_id();
        assert!(
            wait_until(move || {
                e.messages("conv")
                    .first()
                    .map(|m| m.id.is_remote() && m.id != local_id)
                    .unwrap_or(false)
            })
            .await
        );
        assert_eq!(h.transport.send_calls().len(), 1);
        assert!(h.engine.outbox_snapshot().is_empty());
    }

    #[tokio::test]
    async fn positioning_arms_receipts_through_the_wiring() {
        let h = engine(true).await;
        let messages: Vec<_> = (1..6)
            .map(|id| authoritative_message("conv", id, "hi"))
            .collect();
        let target = h.engine.open_conversation(
            "conv",
            bootstrap_page(messages, Some(MessageId::Remote(3))),
        );
        assert!(matches!(target, ScrollTarget::Anchor { index: 2, .. }));

        // Visible before arming: never acknowledged.
        let visible: Vec<MessageId> = (1..6).map(MessageId::Remote).collect();
        h.engine.observe_visible_message_ids("conv", &visible);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.transport.mark_read_calls().is_empty());

        assert_eq!(h.engine.confirm_position("conv", true), None);
        assert_eq!(h.engine.position_phase("conv"), PositionPhase::Ready);
        h.engine.notify_user_interaction("conv");

        h.engine.observe_visible_message_ids("conv", &visible);
        let t = Arc::clone(&h.transport);
        assert!(wait_until(move || !t.mark_read_calls().is_empty()).await);
        let calls = h.transport.mark_read_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.len(), 5);
        let e = Arc::clone(&h.engine);
        assert!(
            wait_until(move || {
                e.messages("conv")
                    .iter()
                    .all(|m| m.is_read_by("me"))
            })
            .await
        );
    }

    #[tokio::test]
    async fn initial_positioned_callback_fires_once_per_open() {
        let h = engine(true).await;
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            h.engine.on_initial_positioned(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        h.engine
            .open_conversation("conv", bootstrap_page(Vec::new(), None));
        assert_eq!(h.engine.confirm_position("conv", false), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.confirm_position("conv", true), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn realtime_events_merge_through_the_store() {
        let h = engine(true).await;
        h.engine
            .open_conversation("conv", bootstrap_page(Vec::new(), None));

        let message = authoritative_message("conv", 9, "pushed");
        h.engine.apply_event(ChatEvent::MessageAdded {
            message: message.clone(),
        });
        // Bootstrap echo of the same message is idempotent.
        h.engine.apply_event(ChatEvent::MessageAdded { message });
        assert_eq!(h.engine.messages("conv").len(), 1);

        h.engine.apply_event(ChatEvent::MessageRead {
            conversation_id: "conv".into(),
            message_ids: vec![MessageId::Remote(9)],
            user_id: "peer".into(),
            read_at: Utc::now(),
        });
        assert!(h.engine.messages("conv")[0].is_read_by("peer"));
    }

    #[tokio::test]
    async fn close_conversation_flushes_pending_receipts() {
        let h = engine(true).await;
        h.engine.open_conversation(
            "conv",
            bootstrap_page(
                vec![authoritative_message("conv", 1, "hi")],
                None,
            ),
        );
        h.engine.confirm_position("conv", false);
        h.engine.set_scrolled_to_latest("conv", true);

        h.engine
            .observe_visible_message_ids("conv", &[MessageId::Remote(1)]);
        h.engine.close_conversation("conv").await;

        assert_eq!(h.transport.mark_read_calls().len(), 1);
    }
}
