//! Coordination recipes built on [`CoordinationStore`](crate::store::CoordinationStore)

pub mod lock;
pub mod queue;
pub mod registry;
pub mod rwlock;

pub use lock::{DistributedLock, LockHandle, LockKind, LockState};
pub use registry::{ServiceRegistration, ServiceRegistry};
pub use rwlock::{DistributedReadWriteLock, RwMode};
