//! Session-bound client of a [`MemoryStore`]

use super::memory::MemoryStore;
use super::path;
use super::session::{SessionId, SessionState};
use super::watch::{WatchCallback, WatchId, WatchMode};
use super::{CoordinationStore, CreateMode, Stat};
use crate::common::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Client scoped to one session and namespace
///
/// Clones share the session.
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<MemoryStore>,
    session: SessionId,
    /// Absolute namespace root, empty for the whole tree
    root: String,
    state_rx: watch::Receiver<SessionState>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("session", &self.session)
            .field("root", &self.root)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl StoreClient {
    pub(crate) fn new(
        store: Arc<MemoryStore>,
        session: SessionId,
        root: String,
        state_rx: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            store,
            session,
            root,
            state_rx,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Ping the store so the session does not expire
    pub fn touch(&self) -> Result<()> {
        self.store.touch(self.session)
    }

    /// Touch the session every `interval` until it ends
    pub fn spawn_keepalive(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if client.touch().is_err() {
                    tracing::debug!("Keepalive for session {} stopped", client.session);
                    break;
                }
            }
        })
    }

    fn absolute(&self, relative: &str) -> Result<String> {
        path::validate(relative)?;
        Ok(if self.root.is_empty() {
            relative.to_string()
        } else if relative == path::ROOT {
            self.root.clone()
        } else {
            format!("{}{}", self.root, relative)
        })
    }

    fn relative(&self, absolute: String) -> String {
        if self.root.is_empty() {
            return absolute;
        }
        match absolute.strip_prefix(&self.root) {
            Some("") => path::ROOT.to_string(),
            Some(rest) => rest.to_string(),
            None => absolute,
        }
    }
}

#[async_trait]
impl CoordinationStore for StoreClient {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn session_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    fn session_events(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn ensure_path(&self, path: &str) -> Result<()> {
        let abs = self.absolute(path)?;
        self.store.ensure_path(self.session, &abs)
    }

    async fn create(&self, path: &str, mode: CreateMode, data: Vec<u8>) -> Result<String> {
        let abs = self.absolute(path)?;
        let actual = self.store.create(self.session, &abs, mode, data)?;
        Ok(self.relative(actual))
    }

    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let abs = self.absolute(path)?;
        self.store.get(self.session, &abs)
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let abs = self.absolute(path)?;
        self.store.exists(self.session, &abs)
    }

    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> Result<Stat> {
        let abs = self.absolute(path)?;
        self.store.set_data(self.session, &abs, data, expected_version)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let abs = self.absolute(path)?;
        self.store.children(self.session, &abs)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let abs = self.absolute(path)?;
        self.store.delete(self.session, &abs, recursive)
    }

    async fn watch(
        &self,
        path: &str,
        mode: WatchMode,
        callback: WatchCallback,
    ) -> Result<WatchId> {
        let abs = self.absolute(path)?;
        self.store
            .add_watch(self.session, &abs, mode, &self.root, callback)
    }

    async fn unwatch(&self, id: WatchId) -> Result<bool> {
        Ok(self.store.remove_watch(id))
    }

    async fn close(&self) -> Result<()> {
        self.store.close_session(self.session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Error;
    use crate::store::watch::{callback, WatchEventKind};
    use std::sync::Mutex;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_namespace_isolation() {
        let store = MemoryStore::new();
        let a = store.connect("app-a", TIMEOUT).unwrap();
        let b = store.connect("app-b", TIMEOUT).unwrap();

        a.ensure_path("/shared").await.unwrap();
        let created = a
            .create("/shared/node", CreateMode::Persistent, b"a".to_vec())
            .await
            .unwrap();
        assert_eq!(created, "/shared/node");

        assert!(b.exists("/shared/node").await.unwrap().is_none());
        assert_eq!(a.children("/").await.unwrap(), vec!["shared"]);
    }

    #[tokio::test]
    async fn test_watch_paths_are_namespace_relative() {
        let store = MemoryStore::new();
        let client = store.connect("ns", TIMEOUT).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client
            .watch(
                "/node",
                WatchMode::Once,
                callback(move |e| sink.lock().unwrap().push(e)),
            )
            .await
            .unwrap();

        client
            .create("/node", CreateMode::Persistent, vec![])
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "/node");
        assert_eq!(events[0].kind, WatchEventKind::Created);
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let store = MemoryStore::new();
        let client = store.connect("", TIMEOUT).unwrap();
        client
            .create("/e", CreateMode::Ephemeral, vec![])
            .await
            .unwrap();
        client.close().await.unwrap();

        assert_eq!(client.session_state(), SessionState::Closed);
        assert!(matches!(
            client.get("/e").await,
            Err(Error::SessionLost(_))
        ));

        let other = store.connect("", TIMEOUT).unwrap();
        assert!(other.exists("/e").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let store = MemoryStore::new();
        let client = store.connect("ns", TIMEOUT).unwrap();
        assert!(matches!(
            client.get("relative").await,
            Err(Error::InvalidPath(_))
        ));
    }
}
