//! Transaction status oracle and enlistment contracts.
//!
//! The pool does not implement a transaction manager. It asks a
//! [`TransactionOracle`] whether a transaction is active for the caller and,
//! if so, enlists the connection's resource with the returned
//! [`TransactionContext`].

use std::fmt;
use std::sync::Arc;

use crate::error::EnlistError;

/// A two-phase-commit capable resource exposed by a physical connection.
pub trait XaResource: Send + Sync + fmt::Debug {
    /// Resource manager identity, used by coordinators to detect duplicates.
    fn resource_id(&self) -> String;
}

/// What is handed to the coordinator on enlistment.
#[derive(Clone, Debug)]
pub enum EnlistResource {
    /// A local (single-resource) transaction bound to one connection.
    Local { connection_id: u64 },
    /// An XA resource participating in a distributed transaction.
    Xa(Arc<dyn XaResource>),
}

/// An in-flight transaction that resources can be enlisted with.
pub trait TransactionContext: Send + Sync {
    /// Transaction identifier, stable for the lifetime of the transaction.
    fn id(&self) -> String;

    /// Associate a listener's resource with this transaction.
    fn enlist(&self, listener_id: u64, resource: &EnlistResource) -> Result<(), EnlistError>;

    /// Dissociate a listener after commit (`success`) or rollback.
    fn delist(&self, listener_id: u64, success: bool);
}

/// Reports whether a transaction is active for the calling context.
pub trait TransactionOracle: Send + Sync {
    fn current(&self) -> Option<Arc<dyn TransactionContext>>;
}

/// Oracle for deployments without transaction integration.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoTransactions;

impl TransactionOracle for NoTransactions {
    fn current(&self) -> Option<Arc<dyn TransactionContext>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_transactions_reports_none() {
        assert!(NoTransactions.current().is_none());
    }

    #[test]
    fn enlist_resource_debug() {
        let local = EnlistResource::Local { connection_id: 3 };
        assert!(format!("{local:?}").contains("connection_id: 3"));
    }
}
