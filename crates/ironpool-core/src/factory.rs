//! Physical connection and connection factory contracts.
//!
//! The pool never speaks to a backend directly. It obtains opaque
//! [`PhysicalConnection`]s from an injected [`ConnectionFactory`], checks
//! them with `is_valid`, and hands them back to the factory for destruction.

use std::fmt;
use std::sync::Arc;

use crate::credential::{Credential, RequestInfo};
use crate::error::FactoryError;
use crate::transaction::XaResource;

/// A real backend resource (socket, database session, mail store...).
///
/// Owned by exactly one pool listener at a time, so implementations only
/// need to be `Send`; the pool serialises access.
pub trait PhysicalConnection: Send + fmt::Debug {
    /// Stable identity for logging and deduplication.
    fn id(&self) -> u64;

    /// Cheap synchronous liveness check.
    fn is_valid(&self) -> bool;

    /// Release the backend resource. Must be idempotent.
    fn destroy(&mut self);

    /// Reset per-lease state before the connection goes back to the idle
    /// set. A failure causes the connection to be destroyed instead.
    fn cleanup(&mut self) -> Result<(), FactoryError> {
        Ok(())
    }

    /// The XA resource to enlist with a distributed transaction, if the
    /// backend supports two-phase commit.
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }
}

/// Factory for physical connections: injected for testability.
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new connection authenticated as `credential`.
    fn create(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> Result<Box<dyn PhysicalConnection>, FactoryError>;

    /// Destroy a connection the pool no longer wants.
    fn destroy(&self, mut connection: Box<dyn PhysicalConnection>) {
        connection.destroy();
    }

    /// Validate a connection. Defaults to the connection's own check.
    fn is_valid(&self, connection: &dyn PhysicalConnection) -> bool {
        connection.is_valid()
    }
}

impl<T: ConnectionFactory + ?Sized> ConnectionFactory for Arc<T> {
    fn create(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> Result<Box<dyn PhysicalConnection>, FactoryError> {
        (**self).create(credential, request_info)
    }

    fn destroy(&self, connection: Box<dyn PhysicalConnection>) {
        (**self).destroy(connection)
    }

    fn is_valid(&self, connection: &dyn PhysicalConnection) -> bool {
        (**self).is_valid(connection)
    }
}
