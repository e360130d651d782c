//! Ephemeral service registry
//!
//! Each live instance is an ephemeral node `/services/<service>/<instance>`
//! holding its JSON-encoded [`ServiceRegistration`]. An instance disappears
//! from the registry as soon as its session ends.

use crate::common::{Error, Result};
use crate::store::path;
use crate::store::{CoordinationStore, CreateMode, SessionId, WatchCallback, WatchId, WatchMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_ROOT: &str = "/services";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service: String,
    pub instance_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub session: SessionId,
}

pub struct ServiceRegistry {
    store: Arc<dyn CoordinationStore>,
    root: String,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("root", &self.root)
            .field("session", &self.store.session_id())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_root(store, DEFAULT_ROOT)
    }

    pub fn with_root(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    fn service_path(&self, service: &str) -> Result<String> {
        if service.is_empty() || service.contains('/') {
            return Err(Error::InvalidPath(format!("bad service name: {:?}", service)));
        }
        Ok(path::join(&self.root, service))
    }

    /// Register an instance of `service`; a random id is generated when
    /// `instance_id` is `None`
    pub async fn register(
        &self,
        service: &str,
        instance_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<ServiceRegistration> {
        let service_path = self.service_path(service)?;
        let instance_id = match instance_id {
            Some(id) if id.is_empty() || id.contains('/') => {
                return Err(Error::InvalidPath(format!("bad instance id: {:?}", id)));
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let registration = ServiceRegistration {
            service: service.to_string(),
            instance_id,
            metadata,
            session: self.store.session_id(),
        };

        self.store.ensure_path(&service_path).await?;
        self.store
            .create(
                &path::join(&service_path, &registration.instance_id),
                CreateMode::Ephemeral,
                serde_json::to_vec(&registration)?,
            )
            .await?;

        tracing::info!(
            "Registered {}/{} (session {})",
            service,
            registration.instance_id,
            registration.session
        );
        Ok(registration)
    }

    /// Graceful removal; `Ok(false)` if the registration is already gone
    pub async fn deregister(&self, registration: &ServiceRegistration) -> Result<bool> {
        let node = path::join(
            &self.service_path(&registration.service)?,
            &registration.instance_id,
        );
        match self.store.delete(&node, false).await {
            Ok(()) => {
                tracing::info!(
                    "Deregistered {}/{}",
                    registration.service,
                    registration.instance_id
                );
                Ok(true)
            }
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Live registrations of `service`, ordered by instance id
    pub async fn instances(&self, service: &str) -> Result<Vec<ServiceRegistration>> {
        let service_path = self.service_path(service)?;
        let names = match self.store.children(&service_path).await {
            Ok(names) => names,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut instances = Vec::with_capacity(names.len());
        for name in names {
            let (data, _) = match self.store.get(&path::join(&service_path, &name)).await {
                Ok(found) => found,
                // session ended between listing and reading
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<ServiceRegistration>(&data) {
                Ok(registration) => instances.push(registration),
                Err(e) => tracing::warn!("Skipping malformed registration {}: {}", name, e),
            }
        }
        Ok(instances)
    }

    /// Persistent watch on membership changes of `service`
    pub async fn watch_service(&self, service: &str, callback: WatchCallback) -> Result<WatchId> {
        let service_path = self.service_path(service)?;
        self.store.ensure_path(&service_path).await?;
        self.store
            .watch(&service_path, WatchMode::Persistent, callback)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{callback, MemoryStore, WatchEventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(store: &Arc<MemoryStore>) -> (ServiceRegistry, Arc<dyn CoordinationStore>) {
        let client: Arc<dyn CoordinationStore> =
            Arc::new(store.connect("reg", Duration::from_secs(30)).unwrap());
        (ServiceRegistry::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let store = MemoryStore::new();
        let (reg, _) = registry(&store);

        reg.register("api", Some("a1"), serde_json::json!({"port": 8080}))
            .await
            .unwrap();
        let generated = reg
            .register("api", None, serde_json::Value::Null)
            .await
            .unwrap();
        assert!(uuid::Uuid::parse_str(&generated.instance_id).is_ok());

        let instances = reg.instances("api").await.unwrap();
        assert_eq!(instances.len(), 2);
        let a1 = instances.iter().find(|i| i.instance_id == "a1").unwrap();
        assert_eq!(a1.metadata["port"], 8080);
        assert!(reg.instances("unknown").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_loss_removes_instances() {
        let store = MemoryStore::new();
        let (owner, client) = registry(&store);
        let (observer, _) = registry(&store);

        owner
            .register("db", Some("primary"), serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(observer.instances("db").await.unwrap().len(), 1);

        store.expire_session(client.session_id());
        assert!(observer.instances("db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_and_watch() {
        let store = MemoryStore::new();
        let (reg, _) = registry(&store);
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        reg.watch_service(
            "cache",
            callback(move |e| {
                if e.kind == WatchEventKind::ChildrenChanged {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .await
        .unwrap();

        let registration = reg
            .register("cache", Some("c1"), serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reg.deregister(&registration).await.unwrap());
        assert!(!reg.deregister(&registration).await.unwrap());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejects_bad_names() {
        let store = MemoryStore::new();
        let (reg, _) = registry(&store);
        assert!(matches!(
            reg.register("a/b", None, serde_json::Value::Null).await,
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            reg.register("svc", Some(""), serde_json::Value::Null).await,
            Err(Error::InvalidPath(_))
        ));
    }
}
