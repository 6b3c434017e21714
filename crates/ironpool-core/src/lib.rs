//! ironpool-core: contracts and plain data shared by the ironpool engine.
//!
//! - **credential**: `Credential`, `RequestInfo`, and the `SecurityCallback` contract
//! - **factory**: `PhysicalConnection` and `ConnectionFactory` contracts
//! - **transaction**: `TransactionOracle` / `TransactionContext` enlistment contracts
//! - **config**: `PoolConfig` with TOML loading and validation
//! - **error**: `PoolError` taxonomy and collaborator error types

pub mod config;
pub mod credential;
pub mod error;
pub mod factory;
pub mod transaction;

pub use config::{FlushStrategy, PoolConfig, PoolStrategy, TransactionSupport};
pub use credential::{Credential, RequestInfo, SecurityCallback, StaticSecurity};
pub use error::{EnlistError, FactoryError, PoolError, PoolResult};
pub use factory::{ConnectionFactory, PhysicalConnection};
pub use transaction::{
    EnlistResource, NoTransactions, TransactionContext, TransactionOracle, XaResource,
};
