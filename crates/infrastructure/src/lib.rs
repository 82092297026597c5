//! Lock backend adapters for the coordinator.

#![forbid(unsafe_code)]

mod ephemeral_node_lock_backend;
mod in_memory_lease_service;
mod in_memory_lock_backend;
mod in_memory_node_tree;
mod lease_lock_backend;
mod postgres_lock_backend;
mod redis_lock_backend;

pub use ephemeral_node_lock_backend::{
    DEFAULT_LOCK_ROOT, EphemeralNodeLockBackend, LockNode, NodeTreeClient,
};
pub use in_memory_lease_service::InMemoryLeaseService;
pub use in_memory_lock_backend::InMemoryLockBackend;
pub use in_memory_node_tree::{InMemoryNodeSession, InMemoryNodeTree};
pub use lease_lock_backend::{
    DEFAULT_LOCK_NAMESPACE, LeaseId, LeaseLock, LeaseLockBackend, LeaseServiceClient,
};
pub use postgres_lock_backend::PostgresLockBackend;
pub use redis_lock_backend::RedisLockBackend;
