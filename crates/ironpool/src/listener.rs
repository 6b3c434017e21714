//! Connection listener: the pool's state holder around one physical connection.
//!
//! ```text
//!            lease              enlist
//!   Idle ───────────▶ Active ───────────▶ Enlisted
//!    ▲                 │  ▲                 │
//!    │    return       │  └──── delist ─────┘
//!    └─────────────────┴────────────────────┘
//!
//!   any state ── destroy ──▶ Destroyed (terminal)
//! ```
//!
//! The three transaction models (none, local, XA) share this one state
//! machine; they differ only in the [`Enlistment`] value chosen when the
//! listener is built.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::{Duration, Instant};

use ironpool_core::{
    Credential, EnlistError, EnlistResource, FactoryError, PhysicalConnection, RequestInfo,
    TransactionContext, TransactionSupport, XaResource,
};

/// Lifecycle state of a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ListenerState {
    /// In the pool's idle set.
    Idle = 0,
    /// Leased to exactly one caller.
    Active = 1,
    /// Leased and participating in a transaction.
    Enlisted = 2,
    /// Physical connection released; terminal.
    Destroyed = 3,
}

impl ListenerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ListenerState::Idle,
            1 => ListenerState::Active,
            2 => ListenerState::Enlisted,
            _ => ListenerState::Destroyed,
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Idle => write!(f, "idle"),
            ListenerState::Active => write!(f, "active"),
            ListenerState::Enlisted => write!(f, "enlisted"),
            ListenerState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Enlistment strategy, fixed at construction.
#[derive(Clone, Debug)]
pub enum Enlistment {
    /// Never enlists; `enlist` and `delist` are no-ops.
    NoTx,
    /// Enlists the connection as a local-transaction resource.
    Local,
    /// Enlists the connection's XA resource with the coordinator.
    Xa(Arc<dyn XaResource>),
}

impl Enlistment {
    /// Pick the enlistment strategy for a freshly created connection.
    pub fn for_connection(
        support: TransactionSupport,
        connection: &dyn PhysicalConnection,
    ) -> Result<Self, FactoryError> {
        match support {
            TransactionSupport::NoTransaction => Ok(Enlistment::NoTx),
            TransactionSupport::LocalTransaction => Ok(Enlistment::Local),
            TransactionSupport::XaTransaction => connection
                .xa_resource()
                .map(Enlistment::Xa)
                .ok_or_else(|| {
                    FactoryError::fatal(format!(
                        "connection {} exposes no XA resource",
                        connection.id()
                    ))
                }),
        }
    }

    fn resource(&self, connection_id: u64) -> Option<EnlistResource> {
        match self {
            Enlistment::NoTx => None,
            Enlistment::Local => Some(EnlistResource::Local { connection_id }),
            Enlistment::Xa(xa) => Some(EnlistResource::Xa(Arc::clone(xa))),
        }
    }
}

/// Wrapper around one physical connection owned by a managed pool.
pub struct ConnectionListener {
    id: u64,
    pool_id: u64,
    connection_id: u64,
    credential: Option<Credential>,
    request_info: Option<RequestInfo>,
    enlistment: Enlistment,
    state: AtomicU8,
    error: AtomicBool,
    destroy_on_return: AtomicBool,
    release_pending: AtomicBool,
    created_at: Instant,
    last_used: Mutex<Instant>,
    transaction: Mutex<Option<Arc<dyn TransactionContext>>>,
    connection: Mutex<Option<Box<dyn PhysicalConnection>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State behind these locks stays consistent across a panic; recover it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionListener {
    /// Wrap a new physical connection. The listener starts `Idle`.
    pub fn new(
        id: u64,
        pool_id: u64,
        connection: Box<dyn PhysicalConnection>,
        credential: Option<Credential>,
        request_info: Option<RequestInfo>,
        enlistment: Enlistment,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            pool_id,
            connection_id: connection.id(),
            credential,
            request_info,
            enlistment,
            state: AtomicU8::new(ListenerState::Idle as u8),
            error: AtomicBool::new(false),
            destroy_on_return: AtomicBool::new(false),
            release_pending: AtomicBool::new(false),
            created_at: now,
            last_used: Mutex::new(now),
            transaction: Mutex::new(None),
            connection: Mutex::new(Some(connection)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the managed pool that owns this listener.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Identity of the wrapped physical connection.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn request_info(&self) -> Option<&RequestInfo> {
        self.request_info.as_ref()
    }

    pub fn enlistment(&self) -> &Enlistment {
        &self.enlistment
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ListenerState::Destroyed
    }

    pub fn is_enlisted(&self) -> bool {
        self.state() == ListenerState::Enlisted
    }

    /// Exact credential match used when scanning the idle set.
    pub fn matches(&self, credential: Option<&Credential>) -> bool {
        Credential::matches(self.credential.as_ref(), credential)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *lock(&self.last_used)
    }

    /// How long the listener has sat unused.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// Move from `from` to `to`, refusing if the current state is not in `from`.
    fn transition(&self, from: &[ListenerState], to: ListenerState) -> Result<(), ListenerState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = ListenerState::from_u8(current);
            if !from.contains(&state) {
                return Err(state);
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// `Idle → Active`.
    pub(crate) fn lease(&self) -> Result<(), ListenerState> {
        self.transition(&[ListenerState::Idle], ListenerState::Active)?;
        self.touch();
        Ok(())
    }

    /// `Active | Enlisted → Idle`.
    pub(crate) fn return_to_idle(&self) -> Result<(), ListenerState> {
        self.transition(
            &[ListenerState::Active, ListenerState::Enlisted],
            ListenerState::Idle,
        )?;
        lock(&self.transaction).take();
        self.release_pending.store(false, Ordering::Release);
        self.touch();
        Ok(())
    }

    /// Any state `→ Destroyed`. Returns `true` for exactly one caller per
    /// listener; every later call returns `false`.
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.state.swap(ListenerState::Destroyed as u8, Ordering::AcqRel)
            != ListenerState::Destroyed as u8
    }

    /// Take the physical connection out for destruction. `None` once taken.
    pub(crate) fn take_connection(&self) -> Option<Box<dyn PhysicalConnection>> {
        lock(&self.connection).take()
    }

    /// Run `f` against the physical connection, if it has not been destroyed.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut dyn PhysicalConnection) -> R) -> Option<R> {
        let mut guard = lock(&self.connection);
        let connection = guard.as_deref_mut()?;
        Some(f(connection))
    }

    /// Reset per-lease state via the connection's `cleanup` hook.
    pub(crate) fn cleanup(&self) -> Result<(), FactoryError> {
        self.with_connection(|c| c.cleanup())
            .unwrap_or_else(|| Err(FactoryError::fatal("connection already destroyed")))
    }

    /// Flag the underlying connection as broken; it will be destroyed
    /// instead of returned to the idle set.
    pub fn set_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Graceful flush: destroy this listener when its caller returns it.
    pub(crate) fn mark_for_destroy(&self) {
        self.destroy_on_return.store(true, Ordering::Release);
    }

    pub fn is_marked_for_destroy(&self) -> bool {
        self.destroy_on_return.load(Ordering::Acquire)
    }

    /// The caller closed its handle while a transaction was still open; the
    /// listener goes back to the pool when the transaction completes.
    pub(crate) fn set_release_pending(&self) {
        self.release_pending.store(true, Ordering::Release);
    }

    /// A new handle picked the listener up again before its transaction
    /// completed.
    pub(crate) fn clear_release_pending(&self) {
        self.release_pending.store(false, Ordering::Release);
    }

    pub fn is_release_pending(&self) -> bool {
        self.release_pending.load(Ordering::Acquire)
    }

    /// Enlist with `tx`. Returns `Ok(false)` for the no-transaction model,
    /// which never enlists.
    pub fn enlist(&self, tx: Arc<dyn TransactionContext>) -> Result<bool, EnlistError> {
        let Some(resource) = self.enlistment.resource(self.connection_id) else {
            return Ok(false);
        };
        if self.state() != ListenerState::Active {
            return Err(EnlistError::new(format!(
                "listener {} cannot enlist while {}",
                self.id,
                self.state()
            )));
        }
        tx.enlist(self.id, &resource)?;
        if let Err(state) = self.transition(&[ListenerState::Active], ListenerState::Enlisted) {
            tx.delist(self.id, false);
            return Err(EnlistError::new(format!(
                "listener {} changed to {state} during enlistment",
                self.id
            )));
        }
        *lock(&self.transaction) = Some(tx);
        Ok(true)
    }

    /// `Enlisted → Active` after commit or rollback. No-op when not enlisted.
    pub fn delist(&self, success: bool) {
        let Some(tx) = lock(&self.transaction).take() else {
            return;
        };
        tx.delist(self.id, success);
        // A concurrent destroy wins; the listener stays Destroyed.
        let _ = self.transition(&[ListenerState::Enlisted], ListenerState::Active);
    }

    /// Identifier of the transaction this listener is enlisted in.
    pub fn transaction_id(&self) -> Option<String> {
        lock(&self.transaction).as_ref().map(|tx| tx.id())
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("credential", &self.credential)
            .field("error", &self.has_error())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnection, RecordingTransaction};

    fn listener(enlistment: Enlistment) -> ConnectionListener {
        ConnectionListener::new(
            1,
            1,
            Box::new(MockConnection::new(42)),
            Some(Credential::new("app", "pw")),
            None,
            enlistment,
        )
    }

    // ── State machine ───────────────────────────────────────────

    #[test]
    fn starts_idle() {
        let l = listener(Enlistment::NoTx);
        assert_eq!(l.state(), ListenerState::Idle);
        assert_eq!(l.connection_id(), 42);
    }

    #[test]
    fn lease_and_return() {
        let l = listener(Enlistment::NoTx);
        l.lease().unwrap();
        assert_eq!(l.state(), ListenerState::Active);
        l.return_to_idle().unwrap();
        assert_eq!(l.state(), ListenerState::Idle);
    }

    #[test]
    fn double_lease_refused() {
        let l = listener(Enlistment::NoTx);
        l.lease().unwrap();
        assert_eq!(l.lease(), Err(ListenerState::Active));
    }

    #[test]
    fn return_from_idle_refused() {
        let l = listener(Enlistment::NoTx);
        assert_eq!(l.return_to_idle(), Err(ListenerState::Idle));
    }

    #[test]
    fn destroyed_is_terminal() {
        let l = listener(Enlistment::NoTx);
        assert!(l.mark_destroyed());
        assert_eq!(l.lease(), Err(ListenerState::Destroyed));
        assert_eq!(l.return_to_idle(), Err(ListenerState::Destroyed));
        assert!(l.is_destroyed());
    }

    #[test]
    fn mark_destroyed_exactly_once() {
        let l = listener(Enlistment::NoTx);
        l.lease().unwrap();
        assert!(l.mark_destroyed());
        assert!(!l.mark_destroyed());
        assert!(!l.mark_destroyed());
    }

    #[test]
    fn mark_destroyed_races_single_winner() {
        let l = Arc::new(listener(Enlistment::NoTx));
        let winners: usize = (0..8)
            .map(|_| {
                let l = Arc::clone(&l);
                std::thread::spawn(move || l.mark_destroyed())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn take_connection_once() {
        let l = listener(Enlistment::NoTx);
        assert!(l.take_connection().is_some());
        assert!(l.take_connection().is_none());
        assert!(l.with_connection(|c| c.id()).is_none());
        assert!(l.cleanup().is_err());
    }

    #[test]
    fn matches_exact_credential() {
        let l = listener(Enlistment::NoTx);
        assert!(l.matches(Some(&Credential::new("app", "pw"))));
        assert!(!l.matches(Some(&Credential::new("other", "pw"))));
        assert!(!l.matches(None));
    }

    // ── Enlistment ─────────────────────────────────────────────

    #[test]
    fn no_tx_never_enlists() {
        let l = listener(Enlistment::NoTx);
        l.lease().unwrap();
        let tx = Arc::new(RecordingTransaction::new("tx-1"));
        assert_eq!(l.enlist(tx.clone()), Ok(false));
        assert_eq!(l.state(), ListenerState::Active);
        assert!(tx.enlisted().is_empty());
        l.delist(true);
        assert_eq!(l.state(), ListenerState::Active);
    }

    #[test]
    fn local_enlist_and_delist() {
        let l = listener(Enlistment::Local);
        l.lease().unwrap();
        let tx = Arc::new(RecordingTransaction::new("tx-2"));

        assert_eq!(l.enlist(tx.clone()), Ok(true));
        assert_eq!(l.state(), ListenerState::Enlisted);
        assert_eq!(l.transaction_id().as_deref(), Some("tx-2"));
        assert_eq!(tx.enlisted(), vec![1]);

        l.delist(true);
        assert_eq!(l.state(), ListenerState::Active);
        assert_eq!(tx.delisted(), vec![(1, true)]);
        assert!(l.transaction_id().is_none());
    }

    #[test]
    fn enlist_requires_active() {
        let l = listener(Enlistment::Local);
        let tx = Arc::new(RecordingTransaction::new("tx-3"));
        assert!(l.enlist(tx).is_err());
    }

    #[test]
    fn coordinator_rejection_leaves_listener_active() {
        let l = listener(Enlistment::Local);
        l.lease().unwrap();
        let tx = Arc::new(RecordingTransaction::rejecting("tx-4"));
        let err = l.enlist(tx).unwrap_err();
        assert!(err.0.contains("rejected"));
        assert_eq!(l.state(), ListenerState::Active);
    }

    #[test]
    fn enlisted_returns_to_idle_and_clears_transaction() {
        let l = listener(Enlistment::Local);
        l.lease().unwrap();
        l.enlist(Arc::new(RecordingTransaction::new("tx-5"))).unwrap();
        l.set_release_pending();
        l.return_to_idle().unwrap();
        assert_eq!(l.state(), ListenerState::Idle);
        assert!(l.transaction_id().is_none());
        assert!(!l.is_release_pending());
    }

    #[test]
    fn xa_enlistment_requires_resource() {
        let plain = MockConnection::new(1);
        let err = Enlistment::for_connection(TransactionSupport::XaTransaction, &plain)
            .unwrap_err();
        assert!(!err.retryable);

        let xa = MockConnection::new(2).with_xa("rm-1");
        let enlistment = Enlistment::for_connection(TransactionSupport::XaTransaction, &xa)
            .unwrap();
        assert!(matches!(enlistment, Enlistment::Xa(ref r) if r.resource_id() == "rm-1"));
    }

    #[test]
    fn xa_enlist_passes_resource() {
        let conn = MockConnection::new(9).with_xa("rm-9");
        let enlistment =
            Enlistment::for_connection(TransactionSupport::XaTransaction, &conn).unwrap();
        let l = ConnectionListener::new(5, 1, Box::new(conn), None, None, enlistment);
        l.lease().unwrap();
        let tx = Arc::new(RecordingTransaction::new("gtx"));
        assert_eq!(l.enlist(tx.clone()), Ok(true));
        assert_eq!(tx.xa_resources(), vec!["rm-9".to_string()]);
    }

    // ── Flags ──────────────────────────────────────────────────

    #[test]
    fn error_and_destroy_flags() {
        let l = listener(Enlistment::NoTx);
        assert!(!l.has_error());
        l.set_error();
        assert!(l.has_error());
        assert!(!l.is_marked_for_destroy());
        l.mark_for_destroy();
        assert!(l.is_marked_for_destroy());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_for_tracks_last_use() {
        let l = listener(Enlistment::NoTx);
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(l.idle_for(Instant::now()) >= Duration::from_secs(90));
        l.touch();
        assert!(l.idle_for(Instant::now()) < Duration::from_secs(1));
    }
}
