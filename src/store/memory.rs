//! In-process coordination store
//!
//! A single-process stand-in for a majority-consistent coordination service.
//! All mutations are serialized under one mutex; watch callbacks are queued in
//! mutation order while that mutex is held and invoked afterwards, outside it,
//! by whichever caller wins the dispatch lock.

use super::client::StoreClient;
use super::path;
use super::session::{SessionEntry, SessionId, SessionState};
use super::watch::{
    WatchCallback, WatchEvent, WatchEventKind, WatchId, WatchMode, WatchRegistration,
};
use super::{CreateMode, Stat};
use crate::common::utils::lock;
use crate::common::{Error, Result, StoreConfig};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Default)]
struct ZNode {
    data: Vec<u8>,
    version: u64,
    cversion: u64,
    ephemeral_owner: Option<SessionId>,
    created_zxid: u64,
    modified_zxid: u64,
    next_sequence: u64,
    children: BTreeSet<String>,
}

impl ZNode {
    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            cversion: self.cversion,
            ephemeral_owner: self.ephemeral_owner,
            created_zxid: self.created_zxid,
            modified_zxid: self.modified_zxid,
            num_children: self.children.len(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    nodes: HashMap<String, ZNode>,
    sessions: HashMap<SessionId, SessionEntry>,
    next_session: SessionId,
    watches: HashMap<String, Vec<WatchRegistration>>,
    watch_paths: HashMap<WatchId, String>,
    next_watch: WatchId,
    /// Global mutation counter
    zxid: u64,
    pending: VecDeque<(WatchCallback, WatchEvent)>,
}

impl StoreState {
    fn live_session(&mut self, session: SessionId) -> Result<&mut SessionEntry> {
        self.sessions
            .get_mut(&session)
            .ok_or(Error::SessionLost(session))
    }

    fn node(&self, abs: &str) -> Result<&ZNode> {
        self.nodes
            .get(abs)
            .ok_or_else(|| Error::NotFound(abs.to_string()))
    }

    fn create_node(
        &mut self,
        session: SessionId,
        abs: &str,
        mode: CreateMode,
        data: Vec<u8>,
    ) -> Result<String> {
        path::validate(abs)?;
        if mode.is_ephemeral() {
            self.live_session(session)?;
        }
        let parent_path = path::parent(abs)
            .ok_or_else(|| Error::AlreadyExists(path::ROOT.to_string()))?
            .to_string();

        let parent = self
            .nodes
            .get_mut(&parent_path)
            .ok_or_else(|| Error::NotFound(parent_path.clone()))?;
        if parent.ephemeral_owner.is_some() {
            return Err(Error::InvalidPath(format!(
                "{} is ephemeral and cannot have children",
                parent_path
            )));
        }

        let actual = if mode.is_sequential() {
            loop {
                let candidate = path::with_sequence(abs, parent.next_sequence);
                parent.next_sequence += 1;
                if !parent.children.contains(path::name(&candidate)) {
                    break candidate;
                }
            }
        } else {
            if parent.children.contains(path::name(abs)) {
                return Err(Error::AlreadyExists(abs.to_string()));
            }
            abs.to_string()
        };

        parent.children.insert(path::name(&actual).to_string());
        parent.cversion += 1;

        self.zxid += 1;
        let owner = if mode.is_ephemeral() {
            if let Some(entry) = self.sessions.get_mut(&session) {
                entry.ephemerals.insert(actual.clone());
            }
            Some(session)
        } else {
            None
        };

        self.nodes.insert(
            actual.clone(),
            ZNode {
                data,
                ephemeral_owner: owner,
                created_zxid: self.zxid,
                modified_zxid: self.zxid,
                ..Default::default()
            },
        );

        self.fire(&actual, WatchEventKind::Created);
        self.fire(&parent_path, WatchEventKind::ChildrenChanged);
        Ok(actual)
    }

    /// Remove a leaf node and notify watchers. Caller guarantees it exists.
    fn remove_node(&mut self, abs: &str) {
        let Some(node) = self.nodes.remove(abs) else {
            return;
        };
        if let Some(owner) = node.ephemeral_owner {
            if let Some(entry) = self.sessions.get_mut(&owner) {
                entry.ephemerals.remove(abs);
            }
        }
        self.zxid += 1;

        let parent_path = path::parent(abs).map(str::to_string);
        if let Some(parent_path) = &parent_path {
            if let Some(parent) = self.nodes.get_mut(parent_path) {
                parent.children.remove(path::name(abs));
                parent.cversion += 1;
            }
        }

        self.fire(abs, WatchEventKind::Deleted);
        if let Some(parent_path) = parent_path {
            self.fire(&parent_path, WatchEventKind::ChildrenChanged);
        }
    }

    /// Post-order listing of a subtree (children before parents)
    fn subtree(&self, abs: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(node) = self.nodes.get(abs) {
            for child in &node.children {
                out.extend(self.subtree(&path::join(abs, child)));
            }
            out.push(abs.to_string());
        }
        out
    }

    fn fire(&mut self, abs: &str, kind: WatchEventKind) {
        let Some(regs) = self.watches.get_mut(abs) else {
            return;
        };

        let mut keep = Vec::with_capacity(regs.len());
        for reg in regs.drain(..) {
            let event = WatchEvent {
                path: relative(&reg.root, abs),
                kind,
            };
            self.pending.push_back((reg.callback.clone(), event));
            if reg.mode == WatchMode::Persistent {
                keep.push(reg);
            } else {
                self.watch_paths.remove(&reg.id);
            }
        }

        *regs = keep;
        if regs.is_empty() {
            self.watches.remove(abs);
        }
    }

    fn drop_session_watches(&mut self, session: SessionId) {
        let watch_paths = &mut self.watch_paths;
        self.watches.retain(|_, regs| {
            regs.retain(|reg| {
                let keep = reg.session != session;
                if !keep {
                    watch_paths.remove(&reg.id);
                }
                keep
            });
            !regs.is_empty()
        });
    }
}

/// Strip a client's namespace root from an absolute path
fn relative(root: &str, abs: &str) -> String {
    if root.is_empty() {
        return abs.to_string();
    }
    if abs == root {
        return path::ROOT.to_string();
    }
    match abs.strip_prefix(root) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => abs.to_string(),
    }
}

/// Shared in-memory coordination store
pub struct MemoryStore {
    state: Mutex<StoreState>,
    dispatch: Mutex<()>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryStore")
            .field("nodes", &state.nodes.len())
            .field("sessions", &state.sessions.len())
            .field("zxid", &state.zxid)
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let mut state = StoreState {
            next_session: 1,
            next_watch: 1,
            ..Default::default()
        };
        state
            .nodes
            .insert(path::ROOT.to_string(), ZNode::default());

        Arc::new(Self {
            state: Mutex::new(state),
            dispatch: Mutex::new(()),
        })
    }

    /// Open a session and return a client scoped under `namespace`
    ///
    /// An empty namespace gives the client the whole tree.
    pub fn connect(self: &Arc<Self>, namespace: &str, timeout: Duration) -> Result<StoreClient> {
        let root = if namespace.is_empty() {
            String::new()
        } else {
            let root = format!("/{}", namespace.trim_matches('/'));
            path::validate(&root)?;
            root
        };

        let (session, state_rx) = self.open_session(timeout);
        if !root.is_empty() {
            self.ensure_path(session, &root)?;
        }
        tracing::debug!("Session {} connected (namespace {:?})", session, namespace);
        Ok(StoreClient::new(self.clone(), session, root, state_rx))
    }

    /// [`connect`](Self::connect) with the configured namespace and timeout
    pub fn connect_with(self: &Arc<Self>, config: &StoreConfig) -> Result<StoreClient> {
        self.connect(&config.namespace, config.session_timeout())
    }

    pub fn open_session(&self, timeout: Duration) -> (SessionId, watch::Receiver<SessionState>) {
        let mut state = lock(&self.state);
        let id = state.next_session;
        state.next_session += 1;
        let (entry, rx) = SessionEntry::new(timeout);
        state.sessions.insert(id, entry);
        (id, rx)
    }

    /// Keep a session alive
    pub fn touch(&self, session: SessionId) -> Result<()> {
        let mut state = lock(&self.state);
        state.live_session(session)?.last_touch = Instant::now();
        Ok(())
    }

    pub fn is_session_alive(&self, session: SessionId) -> bool {
        lock(&self.state).sessions.contains_key(&session)
    }

    /// Graceful close: ephemerals removed, state becomes `Closed`
    pub fn close_session(&self, session: SessionId) -> bool {
        self.end_session(session, SessionState::Closed)
    }

    /// Forced termination, as if the session timed out
    pub fn expire_session(&self, session: SessionId) -> bool {
        self.end_session(session, SessionState::Expired)
    }

    /// Expire every session that has not been touched within its timeout
    pub fn expire_stale_sessions(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<SessionId> = lock(&self.state)
            .sessions
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter(|id| self.expire_session(*id))
            .collect()
    }

    /// Background task expiring stale sessions until the store is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                for id in store.expire_stale_sessions() {
                    tracing::info!("Session {} expired", id);
                }
            }
        })
    }

    fn end_session(&self, session: SessionId, final_state: SessionState) -> bool {
        let ended = {
            let mut state = lock(&self.state);
            match state.sessions.remove(&session) {
                Some(entry) => {
                    for abs in &entry.ephemerals {
                        state.remove_node(abs);
                    }
                    state.drop_session_watches(session);
                    entry.state_tx.send_replace(final_state);
                    tracing::debug!(
                        "Session {} {} ({} ephemeral nodes removed)",
                        session,
                        final_state,
                        entry.ephemerals.len()
                    );
                    true
                }
                None => false,
            }
        };
        self.dispatch_events();
        ended
    }

    /// Run `f` under the store lock on behalf of a live session, then deliver
    /// any queued watch events.
    fn mutate<T>(
        &self,
        session: SessionId,
        f: impl FnOnce(&mut StoreState) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let mut state = lock(&self.state);
            state.live_session(session)?.last_touch = Instant::now();
            f(&mut state)
        };
        self.dispatch_events();
        result
    }

    fn dispatch_events(&self) {
        loop {
            let guard = match self.dispatch.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            };

            loop {
                let next = lock(&self.state).pending.pop_front();
                match next {
                    Some((callback, event)) => callback(event),
                    None => break,
                }
            }

            drop(guard);
            if lock(&self.state).pending.is_empty() {
                return;
            }
        }
    }

    pub fn ensure_path(&self, session: SessionId, abs: &str) -> Result<()> {
        path::validate(abs)?;
        self.mutate(session, |state| {
            let mut targets = path::ancestors(abs);
            if abs != path::ROOT {
                targets.push(abs);
            }
            for target in targets {
                if !state.nodes.contains_key(target) {
                    state.create_node(session, target, CreateMode::Persistent, Vec::new())?;
                }
            }
            Ok(())
        })
    }

    pub fn create(
        &self,
        session: SessionId,
        abs: &str,
        mode: CreateMode,
        data: Vec<u8>,
    ) -> Result<String> {
        self.mutate(session, |state| state.create_node(session, abs, mode, data))
    }

    pub fn get(&self, session: SessionId, abs: &str) -> Result<(Vec<u8>, Stat)> {
        self.mutate(session, |state| {
            let node = state.node(abs)?;
            Ok((node.data.clone(), node.stat()))
        })
    }

    pub fn exists(&self, session: SessionId, abs: &str) -> Result<Option<Stat>> {
        self.mutate(session, |state| Ok(state.nodes.get(abs).map(ZNode::stat)))
    }

    pub fn set_data(
        &self,
        session: SessionId,
        abs: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<Stat> {
        self.mutate(session, |state| {
            state.zxid += 1;
            let zxid = state.zxid;
            let node = state
                .nodes
                .get_mut(abs)
                .ok_or_else(|| Error::NotFound(abs.to_string()))?;
            if let Some(expected) = expected_version {
                if expected != node.version {
                    return Err(Error::BadVersion {
                        path: abs.to_string(),
                        expected,
                        actual: node.version,
                    });
                }
            }
            node.data = data;
            node.version += 1;
            node.modified_zxid = zxid;
            let stat = node.stat();
            state.fire(abs, WatchEventKind::DataChanged);
            Ok(stat)
        })
    }

    pub fn children(&self, session: SessionId, abs: &str) -> Result<Vec<String>> {
        self.mutate(session, |state| {
            Ok(state.node(abs)?.children.iter().cloned().collect())
        })
    }

    pub fn delete(&self, session: SessionId, abs: &str, recursive: bool) -> Result<()> {
        if abs == path::ROOT {
            return Err(Error::InvalidPath("cannot delete the root".into()));
        }
        self.mutate(session, |state| {
            let node = state.node(abs)?;
            if !node.children.is_empty() && !recursive {
                return Err(Error::NotEmpty(abs.to_string()));
            }
            for target in state.subtree(abs) {
                state.remove_node(&target);
            }
            Ok(())
        })
    }

    pub fn add_watch(
        &self,
        session: SessionId,
        abs: &str,
        mode: WatchMode,
        root: &str,
        callback: WatchCallback,
    ) -> Result<WatchId> {
        path::validate(abs)?;
        self.mutate(session, |state| {
            let id = state.next_watch;
            state.next_watch += 1;
            state.watch_paths.insert(id, abs.to_string());
            state
                .watches
                .entry(abs.to_string())
                .or_default()
                .push(WatchRegistration {
                    id,
                    session,
                    mode,
                    root: root.to_string(),
                    callback,
                });
            Ok(id)
        })
    }

    pub fn remove_watch(&self, id: WatchId) -> bool {
        let mut state = lock(&self.state);
        let Some(abs) = state.watch_paths.remove(&id) else {
            return false;
        };
        if let Some(regs) = state.watches.get_mut(&abs) {
            regs.retain(|reg| reg.id != id);
            if regs.is_empty() {
                state.watches.remove(&abs);
            }
        }
        true
    }

    /// Number of nodes, root included
    pub fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::watch::callback;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_create_get_delete() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);

        store.ensure_path(s, "/a").unwrap();
        let path = store
            .create(s, "/a/b", CreateMode::Persistent, b"hello".to_vec())
            .unwrap();
        assert_eq!(path, "/a/b");

        let (data, stat) = store.get(s, "/a/b").unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(stat.version, 0);

        assert!(matches!(
            store.create(s, "/a/b", CreateMode::Persistent, vec![]),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            store.delete(s, "/a", false),
            Err(Error::NotEmpty(_))
        ));
        store.delete(s, "/a/b", false).unwrap();
        assert!(matches!(store.get(s, "/a/b"), Err(Error::NotFound(_))));
        assert!(matches!(
            store.delete(s, "/a/b", false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        assert!(matches!(
            store.create(s, "/missing/child", CreateMode::Persistent, vec![]),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_ensure_path_is_idempotent() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        store.ensure_path(s, "/x/y/z").unwrap();
        store.ensure_path(s, "/x/y/z").unwrap();
        assert_eq!(store.children(s, "/x/y").unwrap(), vec!["z"]);
        assert_eq!(store.node_count(), 4);
    }

    #[test]
    fn test_sequential_nodes_never_collide() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        store.ensure_path(s, "/q").unwrap();

        let a = store
            .create(s, "/q/n-", CreateMode::PersistentSequential, vec![])
            .unwrap();
        let b = store
            .create(s, "/q/n-", CreateMode::EphemeralSequential, vec![])
            .unwrap();
        store.delete(s, &b, false).unwrap();
        let c = store
            .create(s, "/q/n-", CreateMode::PersistentSequential, vec![])
            .unwrap();

        assert_eq!(a, "/q/n-0000000000");
        assert_eq!(b, "/q/n-0000000001");
        assert_eq!(c, "/q/n-0000000002");
    }

    #[test]
    fn test_recursive_delete() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        store.ensure_path(s, "/r/a/b").unwrap();
        store
            .create(s, "/r/a/e", CreateMode::Ephemeral, vec![])
            .unwrap();
        store.delete(s, "/r", true).unwrap();
        assert!(store.exists(s, "/r").unwrap().is_none());
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_ephemeral_cannot_have_children() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        store.create(s, "/e", CreateMode::Ephemeral, vec![]).unwrap();
        assert!(matches!(
            store.create(s, "/e/child", CreateMode::Persistent, vec![]),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_set_data_compare_and_set() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        store.create(s, "/v", CreateMode::Persistent, vec![1]).unwrap();

        let stat = store.set_data(s, "/v", vec![2], Some(0)).unwrap();
        assert_eq!(stat.version, 1);
        assert!(matches!(
            store.set_data(s, "/v", vec![3], Some(0)),
            Err(Error::BadVersion { actual: 1, .. })
        ));
        store.set_data(s, "/v", vec![4], None).unwrap();
        assert_eq!(store.get(s, "/v").unwrap().0, vec![4]);
    }

    #[test]
    fn test_session_close_removes_ephemerals_and_fires_watch_once() {
        let store = MemoryStore::new();
        let (owner, mut owner_rx) = store.open_session(TIMEOUT);
        let (observer, _rx) = store.open_session(TIMEOUT);

        store
            .create(owner, "/eph", CreateMode::Ephemeral, vec![])
            .unwrap();
        store
            .create(owner, "/keep", CreateMode::Persistent, vec![])
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        store
            .add_watch(
                observer,
                "/eph",
                WatchMode::Persistent,
                "",
                callback(move |event| {
                    assert_eq!(event.kind, WatchEventKind::Deleted);
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(store.expire_session(owner));
        assert!(!store.expire_session(owner));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(store.exists(observer, "/eph").unwrap().is_none());
        assert!(store.exists(observer, "/keep").unwrap().is_some());
        assert_eq!(*owner_rx.borrow_and_update(), SessionState::Expired);
        assert!(matches!(
            store.get(owner, "/keep"),
            Err(Error::SessionLost(_))
        ));
    }

    #[test]
    fn test_watch_delivery_follows_mutation_order() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_a = seen.clone();
        let seen_b = seen.clone();
        store
            .add_watch(
                s,
                "/w",
                WatchMode::Persistent,
                "",
                callback(move |e| seen_a.lock().unwrap().push(("a", e.kind))),
            )
            .unwrap();
        store
            .add_watch(
                s,
                "/w",
                WatchMode::Once,
                "",
                callback(move |e| seen_b.lock().unwrap().push(("b", e.kind))),
            )
            .unwrap();

        store.create(s, "/w", CreateMode::Persistent, vec![]).unwrap();
        store.set_data(s, "/w", vec![1], None).unwrap();
        store.delete(s, "/w", false).unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("a", WatchEventKind::Created),
                ("b", WatchEventKind::Created),
                ("a", WatchEventKind::DataChanged),
                ("a", WatchEventKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_callback_may_mutate_store() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        let inner = store.clone();
        store
            .add_watch(
                s,
                "/trigger",
                WatchMode::Once,
                "",
                callback(move |_| {
                    inner
                        .create(s, "/reaction", CreateMode::Persistent, vec![])
                        .unwrap();
                }),
            )
            .unwrap();

        store
            .create(s, "/trigger", CreateMode::Persistent, vec![])
            .unwrap();
        assert!(store.exists(s, "/reaction").unwrap().is_some());
    }

    #[test]
    fn test_remove_watch() {
        let store = MemoryStore::new();
        let (s, _rx) = store.open_session(TIMEOUT);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = store
            .add_watch(
                s,
                "/x",
                WatchMode::Persistent,
                "",
                callback(move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(store.remove_watch(id));
        assert!(!store.remove_watch(id));
        store.create(s, "/x", CreateMode::Persistent, vec![]).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_untouched_sessions() {
        let store = MemoryStore::new();
        let (idle, _rx) = store.open_session(Duration::from_millis(100));
        let (busy, _rx2) = store.open_session(Duration::from_millis(100));
        store
            .create(idle, "/idle", CreateMode::Ephemeral, vec![])
            .unwrap();

        let reaper = store.spawn_reaper(Duration::from_millis(20));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store.touch(busy).unwrap();
        }

        assert!(!store.is_session_alive(idle));
        assert!(store.is_session_alive(busy));
        assert!(store.exists(busy, "/idle").unwrap().is_none());
        reaper.abort();
    }

    #[tokio::test]
    async fn test_connect_with_store_config() {
        use crate::store::CoordinationStore;

        let store = MemoryStore::new();
        let config = StoreConfig {
            namespace: "jobs".into(),
            ..StoreConfig::default()
        };
        let client = store.connect_with(&config).unwrap();
        client
            .create("/task", CreateMode::Persistent, b"t".to_vec())
            .await
            .unwrap();

        let (s, _rx) = store.open_session(TIMEOUT);
        assert!(store.exists(s, "/jobs/task").unwrap().is_some());
    }
}
