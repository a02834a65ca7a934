use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::{retry_delay, BackoffConfig};
use crate::config::SyncConfig;
use crate::domain::{
    Attachment, LocalSendState, Message, MessageId, OutboxItem, OutboxStatus, UserRef,
};
use crate::error::SyncError;
use crate::outbox::persistence::QueueStore;
use crate::store::MessageStore;
use crate::transport::{ChatTransport, ConnectivityMonitor, SendError};

/// Owner of the pending-send queue. One instance per process; it holds the
/// item list, the persistence handle, and the single-flight flush guard, and
/// it is the only writer of the queue store.
pub struct OutboxManager {
    backoff: BackoffConfig,
    storage_key: String,
    store: Arc<MessageStore>,
    transport: Arc<dyn ChatTransport>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    persistence: Arc<dyn QueueStore>,
    items: Mutex<Vec<OutboxItem>>,
    flushing: AtomicBool,
    rerun: AtomicBool,
    next_local_id: AtomicU64,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<OutboxManager>,
}

impl OutboxManager {
    pub fn new(
        config: &SyncConfig,
        store: Arc<MessageStore>,
        transport: Arc<dyn ChatTransport>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        persistence: Arc<dyn QueueStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            backoff: config.backoff,
            storage_key: config.storage_key.clone(),
            store,
            transport,
            connectivity,
            persistence,
            items: Mutex::new(Vec::new()),
            flushing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            next_local_id: AtomicU64::new(1),
            retry_timer: Mutex::new(None),
            weak_self: weak.clone(),
        })
    }

    /// Reload persisted items after a restart: reseed the local-id allocator
    /// above every restored id and re-insert one placeholder per item, then
    /// kick a flush for whatever is due.
    pub async fn restore(&self) {
        let blob = match self.persistence.get(&self.storage_key).await {
            Ok(blob) => blob,
            Err(err) => {
                warn!(component = "outbox", error = %err, "queue store unreadable, starting empty");
                None
            }
        };
        let Some(blob) = blob else { return };

        let restored: Vec<OutboxItem> = match serde_json::from_slice(&blob) {
            Ok(items) => items,
            Err(err) => {
                warn!(component = "outbox", error = %err, "persisted outbox blob unparseable, starting empty");
                return;
            }
        };
        if restored.is_empty() {
            return;
        }

        let max_local = restored
            .iter()
            .map(|item| item.local_message_id)
            .max()
            .unwrap_or(0);
        self.next_local_id.fetch_max(max_local + 1, Ordering::SeqCst);

        for item in &restored {
            self.store.insert_placeholder(item);
        }
        info!(component = "outbox", restored = restored.len(), "outbox restored");
        *self.lock_items() = restored;
        self.spawn_flush();
    }

    /// Queue a message for delivery. The only rejection is an empty payload;
    /// everything after validation is fire-and-forget for the caller: the
    /// optimistic record is visible before this returns and delivery is the
    /// flush loop's problem.
    pub async fn enqueue(
        &self,
        conversation_id: &str,
        sender: UserRef,
        text: String,
        attachments: Vec<Attachment>,
    ) -> Result<OutboxItem, SyncError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(SyncError::Validation("message has no content".into()));
        }

        let now = Utc::now();
        let item = OutboxItem {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            local_message_id: self.next_local_id.fetch_add(1, Ordering::SeqCst),
            sender,
            text,
            attachments,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_retry_at: now,
            last_error: None,
            created_at: now,
        };

        self.lock_items().push(item.clone());
        self.persist().await;
        self.store.insert_placeholder(&item);
        debug!(
            component = "outbox",
            conversation_id,
            outbox_id = %item.id,
            local_message_id = item.local_message_id,
            "message enqueued"
        );
        self.spawn_flush();
        Ok(item)
    }

    /// Reset a failed item and attempt it immediately.
    pub async fn retry_now(&self, outbox_id: &str) {
        let target = {
            let mut items = self.lock_items();
            items.iter_mut().find(|i| i.id == outbox_id).map(|entry| {
                entry.status = OutboxStatus::Pending;
                entry.next_retry_at = Utc::now();
                entry.last_error = None;
                (entry.conversation_id.clone(), entry.local_message_id)
            })
        };
        let Some((conversation_id, local_message_id)) = target else {
            debug!(component = "outbox", outbox_id, "retry for unknown item ignored");
            return;
        };

        self.persist().await;
        self.store
            .set_placeholder_state(&conversation_id, local_message_id, LocalSendState::Pending, None);
        self.spawn_flush();
    }

    /// Drop an item and its placeholder without sending. Safe while a send
    /// is in flight: the completion path re-checks membership and drops a
    /// late server echo instead of re-inserting it.
    pub async fn cancel(&self, outbox_id: &str) -> bool {
        let removed = {
            let mut items = self.lock_items();
            let position = items.iter().position(|i| i.id == outbox_id);
            position.map(|index| items.remove(index))
        };
        let Some(item) = removed else { return false };

        self.persist().await;
        self.store
            .remove_message(&item.conversation_id, item.local_id());
        info!(component = "outbox", outbox_id, "outbox item cancelled");
        true
    }

    pub fn snapshot(&self) -> Vec<OutboxItem> {
        self.lock_items().clone()
    }

    /// Run one flush cycle. A boolean guard keeps this single-flight. The
    /// rerun flag is raised before contending for the guard: a caller that
    /// loses the race has already published its request, so the draining
    /// task's post-cycle check observes it and re-drains. Raising it after
    /// losing would leave a window where the winner checks, sees nothing,
    /// and exits with due work still queued.
    pub async fn flush(&self) {
        self.rerun.store(true, Ordering::SeqCst);
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.drain().await;
            self.flushing.store(false, Ordering::SeqCst);
            if !self.rerun.load(Ordering::SeqCst) {
                return;
            }
            if self.flushing.swap(true, Ordering::SeqCst) {
                // Another caller took the guard; its cycle covers the rerun.
                return;
            }
        }
    }

    pub fn spawn_flush(&self) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move { manager.flush().await });
    }

    async fn drain(&self) {
        loop {
            if !self.connectivity.is_reachable() {
                // Connectivity regain re-triggers the flush, nothing to arm.
                debug!(component = "outbox", "unreachable, flush deferred");
                return;
            }

            let due = {
                let items = self.lock_items();
                let now = Utc::now();
                items
                    .iter()
                    .filter(|i| i.next_retry_at <= now)
                    .min_by_key(|i| i.next_retry_at)
                    .cloned()
            };

            match due {
                Some(item) => self.attempt(item).await,
                None => {
                    self.arm_retry_timer();
                    return;
                }
            }
        }
    }

    async fn attempt(&self, item: OutboxItem) {
        {
            let mut items = self.lock_items();
            let Some(entry) = items.iter_mut().find(|i| i.id == item.id) else {
                return;
            };
            entry.status = OutboxStatus::Pending;
            entry.last_error = None;
        }
        self.persist().await;
        self.store.set_placeholder_state(
            &item.conversation_id,
            item.local_message_id,
            LocalSendState::Pending,
            None,
        );

        // Ephemeral attachment handles may not survive a restart; catch that
        // before burning a network attempt.
        let outcome = match probe_attachments(&item.attachments).await {
            Err(err) => Err(err.to_string()),
            Ok(()) => match self
                .transport
                .send_message(&item.conversation_id, &item.text, &item.attachments)
                .await
            {
                Ok(sent) => Ok(sent),
                Err(err) => {
                    if matches!(err, SendError::Validation(_)) {
                        // A rejection retried with the same payload will keep
                        // failing; make that visible in telemetry.
                        warn!(
                            component = "outbox",
                            outbox_id = %item.id,
                            error = %err,
                            "server rejected payload"
                        );
                    }
                    Err(err.to_string())
                }
            },
        };

        match outcome {
            Ok(sent) => self.complete(item, sent).await,
            Err(error) => self.record_failure(item, error).await,
        }
    }

    async fn complete(&self, item: OutboxItem, sent: crate::transport::SentMessage) {
        let still_queued = {
            let mut items = self.lock_items();
            let before = items.len();
            items.retain(|i| i.id != item.id);
            items.len() != before
        };
        if !still_queued {
            info!(
                component = "outbox",
                outbox_id = %item.id,
                "send completed after cancel, dropping server echo"
            );
            return;
        }

        self.persist().await;
        let authoritative = Message {
            id: MessageId::Remote(sent.id),
            conversation_id: item.conversation_id.clone(),
            text: item.text,
            attachments: sent.attachments.unwrap_or(item.attachments),
            sender: item.sender,
            created_at: sent.created_at,
            edited_at: None,
            read_by: Vec::new(),
            local_state: None,
            send_error: None,
        };
        debug!(
            component = "outbox",
            outbox_id = %item.id,
            message_id = %authoritative.id,
            "send confirmed"
        );
        self.store
            .complete_placeholder(&item.conversation_id, item.local_message_id, authoritative);
    }

    async fn record_failure(&self, item: OutboxItem, error: String) {
        let recorded = {
            let mut items = self.lock_items();
            items.iter_mut().find(|i| i.id == item.id).map(|entry| {
                entry.attempts += 1;
                let delay = retry_delay(self.backoff, entry.attempts);
                entry.next_retry_at =
                    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                entry.status = OutboxStatus::Failed;
                entry.last_error = Some(error.clone());
                entry.attempts
            })
        };
        let Some(attempts) = recorded else {
            // Cancelled while the send was failing; nothing left to update.
            return;
        };

        self.persist().await;
        self.store.set_placeholder_state(
            &item.conversation_id,
            item.local_message_id,
            LocalSendState::Failed,
            Some(error.clone()),
        );
        warn!(
            component = "outbox",
            outbox_id = %item.id,
            attempts,
            error = %error,
            "send attempt failed"
        );
    }

    /// Schedule the next flush for the earliest future due time. The old
    /// timer is aborted first; there is never more than one live handle.
    fn arm_retry_timer(&self) {
        let earliest = self.lock_items().iter().map(|i| i.next_retry_at).min();
        let mut timer = lock(&self.retry_timer);
        if let Some(old) = timer.take() {
            old.abort();
        }
        let Some(due_at) = earliest else { return };
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };

        let delay_ms = (due_at - Utc::now()).num_milliseconds().max(0) as u64;
        // The handle only covers the sleep; the flush runs in its own task so
        // aborting a stale timer can never cancel a flush mid-cycle.
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            manager.spawn_flush();
        }));
    }

    /// Best-effort durability: a failed write is telemetry, not a user-facing
    /// error, and never blocks in-memory operation.
    async fn persist(&self) {
        let snapshot = self.lock_items().clone();
        let blob = match serde_json::to_vec(&snapshot) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(component = "outbox", error = %err, "outbox serialization failed");
                return;
            }
        };
        if let Err(err) = self.persistence.set(&self.storage_key, &blob).await {
            warn!(component = "outbox", error = %err, "outbox persistence failed");
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, Vec<OutboxItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn probe_attachments(attachments: &[Attachment]) -> Result<(), SyncError> {
    for attachment in attachments {
        let Some(path) = local_path(&attachment.uri) else {
            continue;
        };
        if tokio::fs::metadata(path).await.is_err() {
            return Err(SyncError::UnreadableAttachment(format!(
                "{} is no longer readable; re-attach the file and retry",
                attachment.name
            )));
        }
    }
    Ok(())
}

fn local_path(uri: &str) -> Option<&str> {
    if let Some(stripped) = uri.strip_prefix("file://") {
        return Some(stripped);
    }
    if uri.starts_with('/') {
        return Some(uri);
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
