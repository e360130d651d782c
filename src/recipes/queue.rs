//! Sequential-node wait queue shared by the lock recipes
//!
//! A participant creates an ephemeral sequential node under the queue
//! directory, then waits for the node the `blocker` function names to go away.
//! Only the blocking node is watched, so a release wakes one waiter.

use crate::common::{Error, Result};
use crate::store::path;
use crate::store::{notify_callback, CoordinationStore, CreateMode, WatchMode};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One sequential child of a queue directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub sequence: u64,
    pub name: String,
}

impl QueueEntry {
    pub fn has_prefix(&self, prefix: &str) -> bool {
        path::sequence_prefix(&self.name) == prefix
    }
}

/// Sequential children whose prefix is one of `prefixes`, ordered by sequence
pub async fn sorted_children(
    store: &dyn CoordinationStore,
    dir: &str,
    prefixes: &[&str],
) -> Result<Vec<QueueEntry>> {
    let mut entries: Vec<QueueEntry> = store
        .children(dir)
        .await?
        .into_iter()
        .filter_map(|name| {
            let sequence = path::sequence_of(&name)?;
            prefixes
                .contains(&path::sequence_prefix(&name))
                .then_some(QueueEntry { sequence, name })
        })
        .collect();
    entries.sort_by_key(|e| e.sequence);
    Ok(entries)
}

/// Wait for the next change of `target`
///
/// Returns `Ok(true)` when the node changed or is already gone, `Ok(false)`
/// when the deadline passed first. Fails with `SessionLost` if the caller's
/// session ends while waiting.
pub async fn wait_for_change(
    store: &dyn CoordinationStore,
    target: &str,
    deadline: Option<Instant>,
) -> Result<bool> {
    let notify = Arc::new(Notify::new());
    let watch_id = store
        .watch(target, WatchMode::Once, notify_callback(notify.clone()))
        .await?;

    // the node may have vanished between listing and registering the watch
    if store.exists(target).await?.is_none() {
        store.unwatch(watch_id).await?;
        return Ok(true);
    }

    let mut session = store.session_events();
    let changed = async {
        tokio::select! {
            _ = notify.notified() => Ok(()),
            _ = session.wait_for(|state| !state.is_alive()) => {
                Err(Error::SessionLost(store.session_id()))
            }
        }
    };

    let outcome = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, changed).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        },
        None => changed.await.map(|_| true),
    };

    if !matches!(outcome, Ok(true)) {
        // harmless if the watch already fired or the session is gone
        let _ = store.unwatch(watch_id).await;
    }
    outcome
}

/// Create a queue node under `dir`, wait until `blocker` yields no
/// predecessor, and return the node's path.
///
/// `blocker` receives the ordered queue and the index of our own node and
/// names the node we must wait on. Returns `Ok(None)` on timeout. On timeout
/// and on every error path the created node is deleted before returning.
pub async fn enqueue_and_wait<F>(
    store: &dyn CoordinationStore,
    dir: &str,
    prefix: &str,
    prefixes: &[&str],
    data: Vec<u8>,
    deadline: Option<Instant>,
    blocker: F,
) -> Result<Option<String>>
where
    F: Fn(&[QueueEntry], usize) -> Option<String>,
{
    let node = store
        .create(
            &path::join(dir, prefix),
            CreateMode::EphemeralSequential,
            data,
        )
        .await?;

    let outcome = wait_for_turn(store, dir, &node, prefixes, deadline, blocker).await;
    match outcome {
        Ok(true) => Ok(Some(node)),
        Ok(false) => {
            remove_quietly(store, &node).await;
            Ok(None)
        }
        Err(e) => {
            remove_quietly(store, &node).await;
            Err(e)
        }
    }
}

async fn wait_for_turn<F>(
    store: &dyn CoordinationStore,
    dir: &str,
    node: &str,
    prefixes: &[&str],
    deadline: Option<Instant>,
    blocker: F,
) -> Result<bool>
where
    F: Fn(&[QueueEntry], usize) -> Option<String>,
{
    let own_name = path::name(node);
    loop {
        let queue = sorted_children(store, dir, prefixes).await?;
        let Some(position) = queue.iter().position(|e| e.name == own_name) else {
            if !store.session_state().is_alive() {
                return Err(Error::SessionLost(store.session_id()));
            }
            return Err(Error::NotFound(node.to_string()));
        };

        let Some(blocking) = blocker(&queue, position) else {
            return Ok(true);
        };

        tracing::debug!("{} waiting on {}", node, blocking);
        if !wait_for_change(store, &path::join(dir, &blocking), deadline).await? {
            return Ok(false);
        }
    }
}

/// Best-effort delete used on cleanup paths
pub async fn remove_quietly(store: &dyn CoordinationStore, node: &str) {
    match store.delete(node, false).await {
        Ok(()) | Err(Error::NotFound(_)) | Err(Error::SessionLost(_)) => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", node, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sorted_children_filters_prefixes() {
        let store = MemoryStore::new();
        let client = store.connect("", Duration::from_secs(30)).unwrap();
        client.ensure_path("/q").await.unwrap();
        for prefix in ["write-", "read-", "other-", "read-"] {
            client
                .create(
                    &format!("/q/{}", prefix),
                    CreateMode::PersistentSequential,
                    vec![],
                )
                .await
                .unwrap();
        }
        client
            .create("/q/plain", CreateMode::Persistent, vec![])
            .await
            .unwrap();

        let entries = sorted_children(&client, "/q", &["read-", "write-"])
            .await
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["write-0000000000", "read-0000000001", "read-0000000003"]
        );
        assert!(entries[0].has_prefix("write-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_change_times_out() {
        let store = MemoryStore::new();
        let client = store.connect("", Duration::from_secs(30)).unwrap();
        client
            .create("/held", CreateMode::Persistent, vec![])
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!wait_for_change(&client, "/held", Some(deadline))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_change_returns_when_gone() {
        let store = MemoryStore::new();
        let client = store.connect("", Duration::from_secs(30)).unwrap();
        assert!(wait_for_change(&client, "/absent", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_timeout_leaves_no_node() {
        let store = MemoryStore::new();
        let client = store.connect("", Duration::from_secs(30)).unwrap();
        client.ensure_path("/q").await.unwrap();
        client
            .create("/q/lock-", CreateMode::EphemeralSequential, vec![])
            .await
            .unwrap();

        let result = enqueue_and_wait(
            &client,
            "/q",
            "lock-",
            &["lock-"],
            vec![],
            Some(Instant::now()),
            |queue, position| (position > 0).then(|| queue[position - 1].name.clone()),
        )
        .await
        .unwrap();

        assert!(result.is_none());
        assert_eq!(client.children("/q").await.unwrap().len(), 1);
    }
}
