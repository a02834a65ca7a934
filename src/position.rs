use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::MessageStore;

type ReadyListener = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionPhase {
    /// Initial page and anchor still loading; the list stays suppressed.
    Bootstrapping,
    /// Target computed, waiting for the renderer to confirm alignment.
    Positioning,
    /// Settled. Irreversible for this conversation-open.
    Ready,
}

/// Where the renderer should put the viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollTarget {
    /// Align the message at `index` to `viewport_fraction` from the top, so
    /// unread content sits below the new-messages separator.
    Anchor { index: usize, viewport_fraction: f32 },
    /// Align to the newest message.
    Bottom,
}

struct ConversationPosition {
    phase: PositionPhase,
    target: ScrollTarget,
    retried: bool,
    deadline: Option<JoinHandle<()>>,
}

impl Default for ConversationPosition {
    fn default() -> Self {
        Self {
            phase: PositionPhase::Bootstrapping,
            target: ScrollTarget::Bottom,
            retried: false,
            deadline: None,
        }
    }
}

/// Per-conversation initial-scroll state machine:
/// `bootstrapping → positioning → ready`. Going ready unblocks the
/// read-receipt batcher and switches the renderer to follow-newest; it fires
/// exactly once per conversation-open.
pub struct PositionResolver {
    store: Arc<MessageStore>,
    settle_timeout: Duration,
    viewport_fraction: f32,
    state: Mutex<HashMap<String, ConversationPosition>>,
    ready_listeners: Mutex<Vec<ReadyListener>>,
    weak_self: Weak<PositionResolver>,
}

impl PositionResolver {
    pub fn new(
        settle_timeout: Duration,
        viewport_fraction: f32,
        store: Arc<MessageStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            settle_timeout,
            viewport_fraction,
            state: Mutex::new(HashMap::new()),
            ready_listeners: Mutex::new(Vec::new()),
            weak_self: weak.clone(),
        })
    }

    /// Listener for the ready transition. Fired once per conversation-open,
    /// after the lock is released; registration order is not a contract.
    pub fn on_ready(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.lock_listeners().push(Arc::new(listener));
    }

    /// Start (or restart) the machine for a conversation-open.
    pub fn begin(&self, conversation_id: &str) {
        let mut state = self.lock_state();
        let entry = state
            .entry(conversation_id.to_string())
            .or_default();
        if let Some(deadline) = entry.deadline.take() {
            deadline.abort();
        }
        *entry = ConversationPosition::default();
    }

    pub fn phase(&self, conversation_id: &str) -> PositionPhase {
        self.lock_state()
            .get(conversation_id)
            .map(|entry| entry.phase)
            .unwrap_or(PositionPhase::Bootstrapping)
    }

    pub fn target(&self, conversation_id: &str) -> ScrollTarget {
        self.lock_state()
            .get(conversation_id)
            .map(|entry| entry.target)
            .unwrap_or(ScrollTarget::Bottom)
    }

    /// Compute the initial target once the bootstrap page is in the store.
    /// An anchor missing from the loaded window means it was already
    /// consumed; fall back to bottom alignment.
    pub fn resolve(&self, conversation_id: &str) -> ScrollTarget {
        let target = match self.anchor_index(conversation_id) {
            Some(index) => ScrollTarget::Anchor {
                index,
                viewport_fraction: self.viewport_fraction,
            },
            None => ScrollTarget::Bottom,
        };

        {
            let mut state = self.lock_state();
            let entry = state
                .entry(conversation_id.to_string())
                .or_default();
            entry.phase = PositionPhase::Positioning;
            entry.target = target;
            entry.retried = false;
            if let Some(old) = entry.deadline.take() {
                old.abort();
            }
            if matches!(target, ScrollTarget::Anchor { .. }) {
                entry.deadline = self.spawn_deadline(conversation_id);
            }
        }
        debug!(
            component = "position",
            conversation_id,
            ?target,
            "initial target resolved"
        );
        target
    }

    /// Renderer callback after applying the target, one frame later. Returns
    /// a corrected target when another pass is needed, `None` once settled.
    /// The anchor gets exactly one retry (layout may still be measuring);
    /// after that the resolver stops trusting it and aligns to bottom.
    pub fn confirm(&self, conversation_id: &str, anchor_visible: bool) -> Option<ScrollTarget> {
        let decision = {
            let mut state = self.lock_state();
            let Some(entry) = state.get_mut(conversation_id) else {
                return None;
            };
            if entry.phase != PositionPhase::Positioning {
                return None;
            }

            match entry.target {
                ScrollTarget::Bottom => {
                    Self::settle_entry(entry);
                    Decision::Settled
                }
                ScrollTarget::Anchor { .. } if anchor_visible => {
                    Self::settle_entry(entry);
                    Decision::Settled
                }
                ScrollTarget::Anchor { .. } if !entry.retried => {
                    entry.retried = true;
                    Decision::Retry
                }
                ScrollTarget::Anchor { .. } => {
                    entry.target = ScrollTarget::Bottom;
                    Self::settle_entry(entry);
                    Decision::ForcedBottom
                }
            }
        };

        match decision {
            Decision::Settled => {
                self.fire_ready(conversation_id);
                None
            }
            Decision::Retry => {
                // Indexes may have shifted while layout settled; recompute.
                let target = match self.anchor_index(conversation_id) {
                    Some(index) => ScrollTarget::Anchor {
                        index,
                        viewport_fraction: self.viewport_fraction,
                    },
                    None => ScrollTarget::Bottom,
                };
                if let Some(entry) = self.lock_state().get_mut(conversation_id) {
                    entry.target = target;
                }
                Some(target)
            }
            Decision::ForcedBottom => {
                warn!(
                    component = "position",
                    conversation_id, "anchor never confirmed, aligned to bottom"
                );
                self.fire_ready(conversation_id);
                Some(ScrollTarget::Bottom)
            }
        }
    }

    fn force_bottom(&self, conversation_id: &str) {
        let forced = {
            let mut state = self.lock_state();
            match state.get_mut(conversation_id) {
                Some(entry) if entry.phase == PositionPhase::Positioning => {
                    entry.target = ScrollTarget::Bottom;
                    Self::settle_entry(entry);
                    true
                }
                _ => false,
            }
        };
        if forced {
            warn!(
                component = "position",
                conversation_id, "anchor settle timed out, aligned to bottom"
            );
            self.fire_ready(conversation_id);
        }
    }

    fn settle_entry(entry: &mut ConversationPosition) {
        entry.phase = PositionPhase::Ready;
        if let Some(deadline) = entry.deadline.take() {
            deadline.abort();
        }
    }

    // Listeners run outside the lock so they may re-enter the resolver;
    // ones registered mid-fire see the next settle, not this one.
    fn fire_ready(&self, conversation_id: &str) {
        let listeners: Vec<ReadyListener> =
            self.lock_listeners().iter().map(Arc::clone).collect();
        for listener in listeners {
            listener(conversation_id);
        }
    }

    fn spawn_deadline(&self, conversation_id: &str) -> Option<JoinHandle<()>> {
        let resolver = self.weak_self.upgrade()?;
        let conversation = conversation_id.to_string();
        let timeout = self.settle_timeout;
        Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            resolver.force_bottom(&conversation);
        }))
    }

    fn anchor_index(&self, conversation_id: &str) -> Option<usize> {
        let anchor = self.store.anchor(conversation_id)?;
        self.store
            .messages(conversation_id)
            .iter()
            .position(|m| m.id == anchor)
    }

    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, ConversationPosition>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<ReadyListener>> {
        self.ready_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

enum Decision {
    Settled,
    Retry,
    ForcedBottom,
}
