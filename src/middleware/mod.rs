// Middleware for resilient service calls
//
// Provides credential health tracking with failover, and the cancellable
// single-flight slot used by every long-running operation

pub mod credential_pool;
pub mod task_slot;

// Re-export commonly used types
pub use credential_pool::{
    CredentialPool, CredentialView, KeyFormat, KeyHealth, PoolCheckpoint, PoolPolicy,
};
pub use task_slot::{TaskSlot, TaskTicket};
