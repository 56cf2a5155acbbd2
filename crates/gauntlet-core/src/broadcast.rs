//! Session log broadcaster.
//!
//! A process-wide registry mapping session ids to an append-only log history
//! and the set of live subscribers. Publishing appends to history and then
//! best-effort delivers to each subscriber's channel; a subscriber whose
//! receiver is gone is pruned on that publish. Attaching replays the full
//! history before any later entry, and both operations take the same lock, so
//! a subscriber can never observe a live entry ahead of its replay.
//!
//! The lock guards only map and list mutation. Delivery uses unbounded
//! sends, which never block, so a slow or stalled consumer cannot hold up a
//! publisher or other subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// One published log line. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub session_id: String,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::UnboundedSender<LogEntry>,
}

#[derive(Default)]
struct SessionState {
    history: Vec<LogEntry>,
    subscribers: Vec<SubscriberSlot>,
}

#[derive(Default)]
struct Registry {
    sessions: Mutex<HashMap<String, SessionState>>,
    next_subscriber_id: AtomicU64,
}

/// Shared handle to the broadcaster registry. Cloning is cheap; all clones
/// observe the same sessions.
#[derive(Clone, Default)]
pub struct LogBroadcaster {
    registry: Arc<Registry>,
}

/// Live delivery handle returned by [`LogBroadcaster::attach`]. Receives the
/// history replay followed by every later publish, in order. Dropping the
/// subscription without detaching is fine: the dead sender is pruned on the
/// next publish to that session.
pub struct Subscription {
    session_id: String,
    subscriber_id: u64,
    rx: mpsc::UnboundedReceiver<LogEntry>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next entry, or `None` once detached and drained.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionState>> {
        // A panic while holding the lock poisons it; the registry data is
        // still coherent (every mutation is a single append/retain), so keep
        // serving rather than propagating the poison.
        self.registry
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a log line to the session's history and deliver it to every
    /// attached subscriber. Creates the session on first use. Never blocks
    /// and never fails; delivery failures prune the subscriber.
    pub fn publish(&self, session_id: &str, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
            session_id: session_id.to_string(),
        };

        let mut sessions = self.lock_sessions();
        let state = sessions.entry(session_id.to_string()).or_default();
        state.history.push(entry.clone());
        state
            .subscribers
            .retain(|slot| slot.tx.send(entry.clone()).is_ok());
    }

    /// Register a subscriber for the session, replaying the full current
    /// history into its channel before it becomes eligible for live entries.
    pub fn attach(&self, session_id: &str) -> Subscription {
        let subscriber_id = self.registry.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut sessions = self.lock_sessions();
        let state = sessions.entry(session_id.to_string()).or_default();
        for entry in &state.history {
            // Cannot fail: we hold the receiver.
            let _ = tx.send(entry.clone());
        }
        state.subscribers.push(SubscriberSlot { id: subscriber_id, tx });

        debug!(session_id, subscriber_id, replayed = state.history.len(), "subscriber attached");
        Subscription {
            session_id: session_id.to_string(),
            subscriber_id,
            rx,
        }
    }

    /// Remove a subscriber. Idempotent; unknown sessions and already-removed
    /// subscribers are no-ops.
    pub fn detach(&self, subscription: &Subscription) {
        let mut sessions = self.lock_sessions();
        if let Some(state) = sessions.get_mut(&subscription.session_id) {
            state
                .subscribers
                .retain(|slot| slot.id != subscription.subscriber_id);
        }
    }

    /// Copy of the session's history, without attaching. Empty for unknown
    /// sessions.
    pub fn snapshot(&self, session_id: &str) -> Vec<LogEntry> {
        let sessions = self.lock_sessions();
        sessions
            .get(session_id)
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    /// Number of currently attached subscribers for the session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        let sessions = self.lock_sessions();
        sessions
            .get(session_id)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }
}
