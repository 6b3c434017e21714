//! Connection manager: the application-facing entry point.
//!
//! Resolves the caller's credential, leases a listener from the pool,
//! enlists it in the current transaction, and hands out a [`Handle`].
//! Closing a handle whose listener is still enlisted defers the return to
//! the pool until [`ConnectionManager::transaction_completed`].
//!
//! Without `interleaving`, allocations are tracked by transaction: a second
//! allocation in the same transaction, managed pool and credential gets a
//! new handle on the listener already enlisted there. A listener goes back
//! to the pool only once every handle on it is closed.
//!
//! Lock order: `enlisted` before `handles`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ironpool_core::{
    Credential, PoolError, PoolResult, RequestInfo, SecurityCallback, TransactionOracle,
};

use crate::listener::ConnectionListener;
use crate::managed::ManagedConnectionPool;
use crate::pool::{Lease, Pool};
use crate::stats::StatisticsSnapshot;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ManagerInner {
    pool: Arc<Pool>,
    security: Arc<dyn SecurityCallback>,
    oracle: Arc<dyn TransactionOracle>,
    /// Open handles by handle id.
    handles: Mutex<HashMap<u64, Lease>>,
    /// Enlisted leases by transaction id.
    enlisted: Mutex<HashMap<String, Vec<Lease>>>,
    /// Handles dropped outside a runtime, released on the next allocation.
    orphaned: Mutex<Vec<(u64, Lease)>>,
    next_handle: AtomicU64,
}

/// What closing one handle means for its listener.
enum Closing {
    /// Another open handle still uses the listener.
    Shared,
    /// The listener waits for its transaction to complete.
    Deferred,
    /// The listener goes back to the pool now.
    Return,
}

impl ManagerInner {
    /// Give a closed handle's listener back, or defer that until its
    /// transaction completes or its last handle closes.
    async fn release(&self, handle: u64, lease: Lease) -> PoolResult<()> {
        match self.close_handle(handle, lease.listener()) {
            Closing::Shared => {
                tracing::debug!(
                    handle,
                    listener = lease.id(),
                    "handle closed, listener still held by another handle"
                );
                Ok(())
            }
            Closing::Deferred => {
                tracing::debug!(
                    handle,
                    listener = lease.id(),
                    "handle closed inside transaction, deferring release"
                );
                Ok(())
            }
            Closing::Return => {
                self.pool.return_connection(&lease, false).await?;
                Ok(())
            }
        }
    }

    /// Forget `handle` and decide, under both locks, what happens to its
    /// listener. Deferred listeners are flagged for release on completion.
    fn close_handle(&self, handle: u64, listener: &ConnectionListener) -> Closing {
        let enlisted = lock(&self.enlisted);
        let mut handles = lock(&self.handles);
        handles.remove(&handle);
        if handles.values().any(|l| l.id() == listener.id()) {
            return Closing::Shared;
        }
        let tracked = listener.transaction_id().is_some_and(|tx_id| {
            enlisted
                .get(&tx_id)
                .is_some_and(|leases| leases.iter().any(|l| l.id() == listener.id()))
        });
        if tracked {
            listener.set_release_pending();
            return Closing::Deferred;
        }
        Closing::Return
    }

    /// Open a handle on the listener `tx_id` already holds for `pool` and
    /// `credential`, if any.
    fn reuse_enlisted(
        &self,
        tx_id: &str,
        pool: &Arc<ManagedConnectionPool>,
        credential: Option<&Credential>,
    ) -> Option<(u64, Lease)> {
        let enlisted = lock(&self.enlisted);
        let lease = enlisted.get(tx_id)?.iter().find(|l| {
            Arc::ptr_eq(l.pool(), pool)
                && l.listener().is_enlisted()
                && l.listener().matches(credential)
        })?;
        lease.listener().clear_release_pending();
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.handles).insert(id, lease.clone());
        Some((id, lease.clone()))
    }

    /// Release handles whose drop happened outside a runtime.
    async fn release_orphans(&self) {
        let orphans = std::mem::take(&mut *lock(&self.orphaned));
        for (handle, lease) in orphans {
            if let Err(err) = self.release(handle, lease).await {
                tracing::warn!(handle, error = %err, "release of orphaned handle failed");
            }
        }
    }

    /// Stop tracking `listener` under its transaction, delisting it as failed.
    fn abandon_enlistment(&self, listener: &ConnectionListener) {
        let mut enlisted = lock(&self.enlisted);
        let Some(tx_id) = listener.transaction_id() else {
            return;
        };
        if let Some(leases) = enlisted.get_mut(&tx_id) {
            leases.retain(|l| l.id() != listener.id());
            if leases.is_empty() {
                enlisted.remove(&tx_id);
            }
        }
        listener.delist(false);
    }

    async fn connection_error(&self, handle: u64, lease: Lease, reason: &str) -> PoolResult<()> {
        lock(&self.handles).remove(&handle);
        tracing::warn!(handle, listener = lease.id(), reason, "connection error reported");
        self.abandon_enlistment(lease.listener());
        match self.pool.connection_error(&lease).await {
            Ok(()) | Err(PoolError::DoubleRemoval { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Application-facing connection manager. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        pool: Arc<Pool>,
        security: Arc<dyn SecurityCallback>,
        oracle: Arc<dyn TransactionOracle>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                pool,
                security,
                oracle,
                handles: Mutex::new(HashMap::new()),
                enlisted: Mutex::new(HashMap::new()),
                orphaned: Mutex::new(Vec::new()),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.inner.pool
    }

    /// Lease a connection for the current caller.
    ///
    /// Enlists the listener when the oracle reports an active transaction.
    /// If the coordinator rejects it, the listener goes back to the pool and
    /// [`PoolError::EnlistmentFailed`] is returned. Without `interleaving`,
    /// a listener the transaction already holds for this caller is reused.
    pub async fn allocate_connection(
        &self,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<Handle> {
        self.inner.release_orphans().await;
        let credential = self.inner.security.resolve()?;
        let current = self.inner.oracle.current();

        if let Some(tx) = &current {
            if !self.inner.pool.config().interleaving {
                let pool = self
                    .inner
                    .pool
                    .managed_pool(credential.as_ref(), request_info)
                    .await?;
                let tx_id = tx.id();
                if let Some((id, lease)) =
                    self.inner.reuse_enlisted(&tx_id, &pool, credential.as_ref())
                {
                    tracing::debug!(
                        handle = id,
                        listener = lease.id(),
                        tx = %tx_id,
                        "reusing listener enlisted in transaction"
                    );
                    return Ok(Handle {
                        id,
                        lease,
                        manager: Arc::clone(&self.inner),
                        closed: false,
                    });
                }
            }
        }

        let lease = self
            .inner
            .pool
            .get_connection(credential.as_ref(), request_info)
            .await?;

        if let Some(tx) = current {
            let tx_id = tx.id();
            match lease.listener().enlist(tx) {
                Ok(true) => {
                    lock(&self.inner.enlisted)
                        .entry(tx_id.clone())
                        .or_default()
                        .push(lease.clone());
                    tracing::debug!(listener = lease.id(), tx = %tx_id, "listener enlisted");
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        listener = lease.id(),
                        tx = %tx_id,
                        error = %err,
                        "enlistment failed, returning listener to pool"
                    );
                    self.inner.pool.return_connection(&lease, false).await?;
                    return Err(err.into());
                }
            }
        }

        let id = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handles).insert(id, lease.clone());
        tracing::debug!(handle = id, listener = lease.id(), "connection allocated");
        Ok(Handle {
            id,
            lease,
            manager: Arc::clone(&self.inner),
            closed: false,
        })
    }

    /// Delist every listener enlisted in `tx_id` and return those whose
    /// handles were already closed. Returns the number delisted.
    pub async fn transaction_completed(&self, tx_id: &str, success: bool) -> usize {
        let (delisted, pending) = {
            let mut enlisted = lock(&self.inner.enlisted);
            let leases = enlisted.remove(tx_id).unwrap_or_default();
            for lease in &leases {
                lease.listener().delist(success);
            }
            let count = leases.len();
            let pending: Vec<_> = leases
                .into_iter()
                .filter(|l| l.listener().is_release_pending())
                .collect();
            (count, pending)
        };

        for lease in &pending {
            if let Err(err) = self.inner.pool.return_connection(lease, false).await {
                tracing::warn!(listener = lease.id(), error = %err, "deferred release failed");
            }
        }
        tracing::debug!(
            tx = tx_id,
            success,
            delisted,
            released = pending.len(),
            "transaction completed"
        );
        delisted
    }

    /// Number of handles allocated and not yet closed.
    pub fn live_handles(&self) -> usize {
        lock(&self.inner.handles).len()
    }

    pub async fn statistics(&self) -> StatisticsSnapshot {
        self.inner.pool.statistics().await
    }

    /// Shut the pool down. Open handles become inert.
    pub async fn shutdown(&self) -> usize {
        let open = {
            let mut handles = lock(&self.inner.handles);
            let open = handles.len();
            handles.clear();
            open
        };
        lock(&self.inner.enlisted).clear();
        lock(&self.inner.orphaned).clear();
        if open > 0 {
            tracing::warn!(open, "shutting down with open handles");
        }
        self.inner.pool.shutdown().await
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("pool", &self.inner.pool)
            .field("live_handles", &self.live_handles())
            .finish_non_exhaustive()
    }
}

/// An application's claim on one leased connection.
///
/// Closing is idempotent. A handle dropped without being closed is released
/// on a spawned task when a tokio runtime is available. Dropped outside a
/// runtime, its listener stays leased until the manager's next
/// `allocate_connection`, which releases it first.
pub struct Handle {
    id: u64,
    lease: Lease,
    manager: Arc<ManagerInner>,
    closed: bool,
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listener(&self) -> &Arc<ConnectionListener> {
        self.lease.listener()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run `f` against the physical connection.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn ironpool_core::PhysicalConnection) -> R,
    ) -> PoolResult<R> {
        if self.closed {
            return Err(PoolError::InvalidHandle(self.id));
        }
        self.lease
            .listener()
            .with_connection(f)
            .ok_or(PoolError::InvalidHandle(self.id))
    }

    /// Give the connection back. Later calls do nothing.
    pub async fn close(&mut self) -> PoolResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.manager.release(self.id, self.lease.clone()).await
    }

    /// Report the connection as broken: it is delisted, destroyed, and the
    /// flush strategy applied. Later calls (and `close`) do nothing.
    pub async fn connection_error(&mut self, reason: &str) -> PoolResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.manager
            .connection_error(self.id, self.lease.clone(), reason)
            .await
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("listener", &self.lease.id())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(handle = self.id, "handle dropped without close, releasing");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                handle = self.id,
                listener = self.lease.id(),
                "handle dropped outside a tokio runtime, release deferred to next allocation"
            );
            lock(&self.manager.orphaned).push((self.id, self.lease.clone()));
            return;
        };
        let manager = Arc::clone(&self.manager);
        let id = self.id;
        let lease = self.lease.clone();
        runtime.spawn(async move {
            if let Err(err) = manager.release(id, lease).await {
                tracing::warn!(handle = id, error = %err, "release of dropped handle failed");
            }
        });
    }
}
