//! Shared fixtures and collaborator fakes for the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    Attachment, BootstrapPage, Message, MessageId, OutboxItem, OutboxStatus, UserRef,
};
use crate::transport::{
    ChatTransport, ConnectivityMonitor, MarkReadAck, SendError, SentMessage,
};

pub fn user(id: &str) -> UserRef {
    UserRef {
        id: id.to_string(),
        display_name: format!("user-{id}"),
        avatar_url: None,
    }
}

pub fn authoritative_message(conversation_id: &str, remote_id: u64, text: &str) -> Message {
    Message {
        id: MessageId::Remote(remote_id),
        conversation_id: conversation_id.to_string(),
        text: text.to_string(),
        attachments: Vec::new(),
        sender: user("peer"),
        created_at: Utc::now(),
        edited_at: None,
        read_by: Vec::new(),
        local_state: None,
        send_error: None,
    }
}

pub fn outbox_item(conversation_id: &str, local_message_id: u64, text: &str) -> OutboxItem {
    OutboxItem {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        local_message_id,
        sender: user("me"),
        text: text.to_string(),
        attachments: Vec::new(),
        status: OutboxStatus::Pending,
        attempts: 0,
        next_retry_at: Utc::now(),
        last_error: None,
        created_at: Utc::now(),
    }
}

pub fn attachment(uri: &str) -> Attachment {
    Attachment {
        uri: uri.to_string(),
        name: "photo.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        size: 1024,
    }
}

pub fn bootstrap_page(messages: Vec<Message>, anchor: Option<MessageId>) -> BootstrapPage {
    BootstrapPage {
        messages,
        has_more_before: false,
        prev_cursor: None,
        has_more_after: false,
        next_cursor: None,
        anchor_message_id: anchor,
    }
}

/// Poll `condition` until it holds or about a second passes.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

/// Scriptable transport: queued results are consumed in order; when the
/// queue is empty, sends succeed with a fresh remote id and mark-read echoes
/// its input.
#[derive(Default)]
pub struct FakeTransport {
    send_results: Mutex<VecDeque<Result<SentMessage, SendError>>>,
    send_calls: Mutex<Vec<(String, String)>>,
    send_delay: Mutex<Option<std::time::Duration>>,
    mark_read_results: Mutex<VecDeque<Result<MarkReadAck, SendError>>>,
    mark_read_calls: Mutex<Vec<(String, Vec<MessageId>)>>,
    next_remote_id: AtomicU64,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_send_result(&self, result: Result<SentMessage, SendError>) {
        lock(&self.send_results).push_back(result);
    }

    /// Hold every send for `delay` before completing, to exercise
    /// cancellation while a send is in flight.
    pub fn set_send_delay(&self, delay: std::time::Duration) {
        *lock(&self.send_delay) = Some(delay);
    }

    pub fn push_mark_read_result(&self, result: Result<MarkReadAck, SendError>) {
        lock(&self.mark_read_results).push_back(result);
    }

    pub fn send_calls(&self) -> Vec<(String, String)> {
        lock(&self.send_calls).clone()
    }

    pub fn mark_read_calls(&self) -> Vec<(String, Vec<MessageId>)> {
        lock(&self.mark_read_calls).clone()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        _attachments: &[Attachment],
    ) -> Result<SentMessage, SendError> {
        lock(&self.send_calls).push((conversation_id.to_string(), text.to_string()));
        let delay = *lock(&self.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = lock(&self.send_results).pop_front() {
            return result;
        }
        Ok(SentMessage {
            id: 100 + self.next_remote_id.fetch_add(1, Ordering::SeqCst),
            created_at: Utc::now(),
            attachments: None,
        })
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        message_ids: &[MessageId],
    ) -> Result<MarkReadAck, SendError> {
        lock(&self.mark_read_calls).push((conversation_id.to_string(), message_ids.to_vec()));
        if let Some(result) = lock(&self.mark_read_results).pop_front() {
            return result;
        }
        Ok(MarkReadAck {
            message_ids: message_ids.to_vec(),
            read_at: Utc::now(),
        })
    }
}

/// Toggleable reachability with listener fan-out, mirroring how a platform
/// connectivity watcher behaves.
pub struct FakeConnectivity {
    reachable: AtomicBool,
    listeners: Mutex<Vec<Box<dyn Fn(bool) + Send + Sync>>>,
}

impl FakeConnectivity {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        for listener in lock(&self.listeners).iter() {
            listener(reachable);
        }
    }
}

impl ConnectivityMonitor for FakeConnectivity {
    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>) {
        lock(&self.listeners).push(listener);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
