//! ironpool: generic connection pool and connection manager.
//!
//! - **listener**: `ConnectionListener`, one physical connection and its state machine
//! - **managed**: `ManagedConnectionPool`, bounded LIFO pool for one partition key
//! - **pool**: `Pool`, strategy-level map from credential / request info to managed pools
//! - **manager**: `ConnectionManager` and `Handle`, the application-facing surface
//! - **remover**: `IdleRemover`, background reaping and validation
//! - **stats**: `PoolStatistics` counters and serializable snapshots

pub mod listener;
pub mod managed;
pub mod manager;
pub mod pool;
pub mod remover;
pub mod stats;

#[cfg(test)]
mod test_support;

pub use listener::{ConnectionListener, Enlistment, ListenerState};
pub use managed::{FlushMode, ManagedConnectionPool, ReleaseOutcome};
pub use manager::{ConnectionManager, Handle};
pub use pool::{Lease, Pool, SubPoolKey};
pub use remover::IdleRemover;
pub use stats::{PoolStatistics, StatisticsSnapshot, WAIT_BUCKETS_MS};
