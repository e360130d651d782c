//! Watch registrations and change notifications

use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type WatchId = u64;

/// What happened to the watched path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Created,
    DataChanged,
    Deleted,
    ChildrenChanged,
}

/// Notification delivered to a watch callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Path as seen by the client that registered the watch
    pub path: String,
    pub kind: WatchEventKind,
}

/// One-shot watches are dropped after their first event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    Once,
    Persistent,
}

pub type WatchCallback = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Wrap a closure as a [`WatchCallback`]
pub fn callback<F>(f: F) -> WatchCallback
where
    F: Fn(WatchEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Watch that wakes a [`tokio::sync::Notify`] on every event
pub fn notify_callback(notify: Arc<tokio::sync::Notify>) -> WatchCallback {
    Arc::new(move |_event| notify.notify_one())
}

pub(crate) struct WatchRegistration {
    pub id: WatchId,
    pub session: u64,
    pub mode: WatchMode,
    /// Namespace root of the registering client, stripped from event paths
    pub root: String,
    pub callback: WatchCallback,
}

impl std::fmt::Debug for WatchRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistration")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("mode", &self.mode)
            .field("root", &self.root)
            .finish()
    }
}
