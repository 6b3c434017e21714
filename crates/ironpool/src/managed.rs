//! Managed connection pool: a bounded set of listeners for one partition key.
//!
//! ```text
//! acquire(credential)
//!   → permit from Semaphore(max_size)      (wait ≤ blocking_timeout)
//!     → matching idle listener (LIFO)       → validate-on-match? → lease
//!     → none, room left                     → factory.create → lease
//!     → none, full of other credentials     → evict oldest idle → create
//! release(listener)
//!   → cleanup ok, no error                  → idle set, permit back
//!   → errored / marked / cleanup failed     → destroy, permit back
//! ```
//!
//! Every leased listener holds one (forgotten) semaphore permit. The permit
//! goes back exactly once, by whichever path removes the listener from the
//! checked-out set under the pool lock. Creations and validations in flight
//! also hold a permit and are counted in `pending`, which keeps
//! `idle + checked_out + pending <= max_size` at all times.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

use ironpool_core::{
    ConnectionFactory, Credential, FactoryError, PoolConfig, PoolError, PoolResult, RequestInfo,
};

use crate::listener::{ConnectionListener, Enlistment};
use crate::stats::{PoolStatistics, StatisticsSnapshot};

/// Which listeners a flush destroys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// Idle listeners that fail validation.
    Invalid,
    /// Every idle listener.
    Idle,
    /// Every idle listener now; active ones when they are returned.
    Gracefully,
    /// Every listener, idle or active.
    All,
}

/// What `release` did with a returned listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back in the idle set.
    Idle,
    /// Destroyed; `errored` when the caller had flagged a connection error.
    Destroyed { errored: bool },
    /// Another path had already destroyed it; nothing to do.
    AlreadyDestroyed,
}

#[derive(Debug, Default)]
struct Inner {
    /// Idle listeners; the back is the most recently returned.
    idle: VecDeque<Arc<ConnectionListener>>,
    /// Leased listeners keyed by listener id.
    checked_out: HashMap<u64, Arc<ConnectionListener>>,
    /// Creations and validations in flight.
    pending: usize,
}

impl Inner {
    fn size(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.pending
    }

    /// Take a listener out of whichever collection holds it and mark it
    /// destroyed. Returns `None` if it was already destroyed, otherwise
    /// whether a leased permit must be handed back.
    fn detach(&mut self, listener: &ConnectionListener) -> Option<bool> {
        if !listener.mark_destroyed() {
            return None;
        }
        if self.checked_out.remove(&listener.id()).is_some() {
            return Some(true);
        }
        if let Some(pos) = self.idle.iter().position(|l| l.id() == listener.id()) {
            self.idle.remove(pos);
        }
        Some(false)
    }
}

/// A semaphore permit that wakes unfair waiters when it is dropped.
struct Permit<'a> {
    permit: Option<OwnedSemaphorePermit>,
    released: &'a Notify,
}

impl Permit<'_> {
    /// Keep the slot for a leased listener; it comes back through
    /// `return_permits` when the listener leaves the checked-out set.
    fn forget(mut self) {
        if let Some(permit) = self.permit.take() {
            permit.forget();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.released.notify_waiters();
        }
    }
}

enum Step {
    Reuse(Arc<ConnectionListener>),
    Create { evicted: Option<Arc<ConnectionListener>> },
}

/// Bounded pool of listeners sharing one partition key.
pub struct ManagedConnectionPool {
    id: u64,
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    default_credential: Option<Credential>,
    default_request_info: Option<RequestInfo>,
    inner: Mutex<Inner>,
    semaphore: Arc<Semaphore>,
    listener_ids: Arc<AtomicU64>,
    statistics: PoolStatistics,
    shutdown: AtomicBool,
    filling: AtomicBool,
    /// Bumped on every failed creation when fast-fail is on.
    failure_epoch: AtomicU64,
    creation_failed: Notify,
    /// Signalled whenever a permit goes back; unfair waiters park on it.
    permit_released: Notify,
}

impl ManagedConnectionPool {
    pub fn new(id: u64, config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let name = config.name.clone();
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        tracing::debug!(
            pool = %name,
            max_size = config.max_size,
            min_size = config.min_size,
            fair = config.fair,
            "managed connection pool created"
        );
        Self {
            id,
            name,
            config,
            factory,
            default_credential: None,
            default_request_info: None,
            inner: Mutex::new(Inner::default()),
            semaphore,
            listener_ids: Arc::new(AtomicU64::new(1)),
            statistics: PoolStatistics::new(),
            shutdown: AtomicBool::new(false),
            filling: AtomicBool::new(false),
            failure_epoch: AtomicU64::new(0),
            creation_failed: Notify::new(),
            permit_released: Notify::new(),
        }
    }

    /// Builder method: credential and request info used for prefill and
    /// for callers that present none.
    pub fn with_defaults(
        self,
        credential: Option<Credential>,
        request_info: Option<RequestInfo>,
    ) -> Self {
        Self {
            default_credential: credential,
            default_request_info: request_info,
            ..self
        }
    }

    /// Builder method: share a listener id sequence with sibling pools.
    pub fn with_listener_ids(self, ids: Arc<AtomicU64>) -> Self {
        Self {
            listener_ids: ids,
            ..self
        }
    }

    /// Builder method: name used in logs.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn shutdown_error(&self) -> PoolError {
        PoolError::Shutdown(self.name.clone())
    }

    fn fast_fail_error(&self) -> PoolError {
        PoolError::CreationFailed {
            retryable: true,
            reason: format!(
                "pool {}: backing resource unavailable, failing fast",
                self.name
            ),
        }
    }

    fn check_owner(&self, listener: &ConnectionListener) -> PoolResult<()> {
        if listener.pool_id() != self.id {
            return Err(PoolError::ForeignListener {
                listener: listener.id(),
                pool: self.name.clone(),
            });
        }
        Ok(())
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> Permit<'_> {
        Permit {
            permit: Some(permit),
            released: &self.permit_released,
        }
    }

    /// Give back permits of listeners leaving the checked-out set.
    fn return_permits(&self, count: usize) {
        self.semaphore.add_permits(count);
        self.permit_released.notify_waiters();
    }

    // ── Acquire ─────────────────────────────────────────────────

    /// Lease a listener whose credential equals `credential`, creating one
    /// if none is idle and the pool has room.
    ///
    /// Waits up to `blocking_timeout` for capacity and fails with
    /// [`PoolError::PoolExhausted`] after that. Factory failures surface as
    /// [`PoolError::CreationFailed`] with the factory's retryable flag.
    pub async fn acquire(
        self: &Arc<Self>,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<Arc<ConnectionListener>> {
        if self.is_shutdown() {
            return Err(self.shutdown_error());
        }
        let credential = credential.or(self.default_credential.as_ref());
        let request_info = request_info.or(self.default_request_info.as_ref());

        let started = Instant::now();
        let permit = self.acquire_permit().await?;
        self.statistics.record_wait(started.elapsed());

        let mut skip_idle = false;
        loop {
            let step = {
                let mut inner = self.inner.lock().await;
                if self.is_shutdown() {
                    return Err(self.shutdown_error());
                }
                self.next_step(&mut inner, credential, skip_idle)?
            };

            let evicted = match step {
                Step::Reuse(candidate) => {
                    if !self.config.validate_on_match || self.validate(&candidate) {
                        let mut inner = self.inner.lock().await;
                        inner.pending -= 1;
                        if candidate.is_destroyed() {
                            // Removed through a stale reference while validating.
                            continue;
                        }
                        inner.checked_out.insert(candidate.id(), Arc::clone(&candidate));
                        self.statistics.record_in_use(inner.checked_out.len());
                        drop(inner);
                        permit.forget();
                        tracing::debug!(
                            pool = %self.name,
                            listener = candidate.id(),
                            "supplying idle connection from pool"
                        );
                        return Ok(candidate);
                    }

                    tracing::warn!(
                        pool = %self.name,
                        listener = candidate.id(),
                        "destroying connection that failed validation on match"
                    );
                    {
                        let mut inner = self.inner.lock().await;
                        inner.pending -= 1;
                        inner.detach(&candidate);
                    }
                    self.finish_destroy(&candidate);

                    if self.config.use_fast_fail {
                        tracing::debug!(
                            pool = %self.name,
                            "fast fail: skipping remaining idle connections"
                        );
                        skip_idle = true;
                    }
                    continue;
                }
                Step::Create { evicted } => evicted,
            };

            if let Some(evicted) = evicted {
                tracing::debug!(
                    pool = %self.name,
                    listener = evicted.id(),
                    "evicting idle connection held under a different credential"
                );
                self.finish_destroy(&evicted);
            }
            return self.create_leased(permit, credential, request_info).await;
        }
    }

    /// Decide, under the pool lock, whether to reuse an idle listener or
    /// create a new one. Either way `pending` is incremented.
    fn next_step(
        &self,
        inner: &mut Inner,
        credential: Option<&Credential>,
        skip_idle: bool,
    ) -> PoolResult<Step> {
        if !skip_idle {
            while let Some(pos) = inner.idle.iter().rposition(|l| l.matches(credential)) {
                let Some(candidate) = inner.idle.remove(pos) else {
                    break;
                };
                if candidate.lease().is_ok() {
                    inner.pending += 1;
                    return Ok(Step::Reuse(candidate));
                }
            }
        }

        let mut evicted = None;
        if inner.size() >= self.config.max_size {
            // Holding a permit guarantees at least one idle listener here.
            let Some(victim) = inner.idle.pop_front() else {
                return Err(PoolError::PoolExhausted {
                    pool: self.name.clone(),
                    timeout: self.config.blocking_timeout(),
                });
            };
            victim.mark_destroyed();
            evicted = Some(victim);
        }
        inner.pending += 1;
        Ok(Step::Create { evicted })
    }

    /// Fair pools always queue behind earlier waiters; unfair pools first
    /// try to take a free permit directly.
    async fn acquire_permit(&self) -> PoolResult<Permit<'_>> {
        if !self.config.fair {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => return Ok(self.permit(permit)),
                Err(TryAcquireError::Closed) => return Err(self.shutdown_error()),
                Err(TryAcquireError::NoPermits) => {}
            }
        }
        if self.semaphore.available_permits() == 0 {
            self.statistics.record_queued();
        }

        let fast_fail = self.config.use_fast_fail;
        let epoch = self.failure_epoch.load(Ordering::Acquire);
        let creation_failed = self.creation_failed.notified();
        tokio::pin!(creation_failed);
        creation_failed.as_mut().enable();

        let timeout = self.config.blocking_timeout();
        let wait = tokio::time::timeout(timeout, self.wait_for_permit());

        let permit = tokio::select! {
            result = wait => match result {
                Ok(Some(permit)) => self.permit(permit),
                Ok(None) => return Err(self.shutdown_error()),
                Err(_) => {
                    self.statistics.record_blocking_failure();
                    tracing::debug!(pool = %self.name, ?timeout, "blocking timeout expired");
                    return Err(PoolError::PoolExhausted {
                        pool: self.name.clone(),
                        timeout,
                    });
                }
            },
            _ = &mut creation_failed, if fast_fail => {
                return Err(self.fast_fail_error());
            }
        };

        if fast_fail && self.failure_epoch.load(Ordering::Acquire) != epoch {
            return Err(self.fast_fail_error());
        }
        Ok(permit)
    }

    /// Fair pools queue on the semaphore in arrival order. Unfair pools
    /// retry whenever a permit goes back, so a caller arriving at that
    /// moment can take it before a parked waiter wakes. `None` once the
    /// semaphore is closed.
    async fn wait_for_permit(&self) -> Option<OwnedSemaphorePermit> {
        if self.config.fair {
            return Arc::clone(&self.semaphore).acquire_owned().await.ok();
        }
        loop {
            let released = self.permit_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => return Some(permit),
                Err(TryAcquireError::Closed) => return None,
                Err(TryAcquireError::NoPermits) => released.await,
            }
        }
    }

    async fn create_leased(
        self: &Arc<Self>,
        permit: Permit<'_>,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<Arc<ConnectionListener>> {
        match self.create_listener(credential, request_info) {
            Ok(listener) => {
                // A fresh listener is Idle until leased here.
                let _ = listener.lease();
                let in_use = {
                    let mut inner = self.inner.lock().await;
                    inner.pending -= 1;
                    inner.checked_out.insert(listener.id(), Arc::clone(&listener));
                    inner.checked_out.len()
                };
                self.statistics.record_in_use(in_use);
                permit.forget();
                tracing::debug!(
                    pool = %self.name,
                    listener = listener.id(),
                    connection = listener.connection_id(),
                    "supplying new connection"
                );
                self.trigger_prefill();
                Ok(listener)
            }
            Err(err) => {
                self.inner.lock().await.pending -= 1;
                if self.config.use_fast_fail {
                    self.failure_epoch.fetch_add(1, Ordering::AcqRel);
                    self.creation_failed.notify_waiters();
                }
                drop(permit);
                tracing::warn!(
                    pool = %self.name,
                    retryable = err.retryable,
                    error = %err,
                    "failed to create connection"
                );
                Err(err.into())
            }
        }
    }

    /// Call the factory and wrap the result. The listener starts `Idle`.
    fn create_listener(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> Result<Arc<ConnectionListener>, FactoryError> {
        let started = Instant::now();
        let connection = self.factory.create(credential, request_info)?;
        let enlistment =
            match Enlistment::for_connection(self.config.transaction_support, connection.as_ref()) {
                Ok(enlistment) => enlistment,
                Err(err) => {
                    self.factory.destroy(connection);
                    return Err(err);
                }
            };
        self.statistics.record_created(started.elapsed());

        let id = self.listener_ids.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ConnectionListener::new(
            id,
            self.id,
            connection,
            credential.cloned(),
            request_info.cloned(),
            enlistment,
        )))
    }

    fn validate(&self, listener: &ConnectionListener) -> bool {
        listener
            .with_connection(|c| self.factory.is_valid(c))
            .unwrap_or(false)
    }

    /// Hand the physical connection back to the factory. Safe to call more
    /// than once; only the first call reaches the factory.
    fn finish_destroy(&self, listener: &ConnectionListener) {
        if let Some(connection) = listener.take_connection() {
            self.factory.destroy(connection);
            self.statistics.record_destroyed();
            tracing::debug!(
                pool = %self.name,
                listener = listener.id(),
                "connection destroyed"
            );
        }
    }

    // ── Release / remove ────────────────────────────────────────

    /// Return a leased listener. Errored, destroy-marked or uncleanable
    /// listeners are destroyed instead of going back to the idle set.
    pub async fn release(&self, listener: &Arc<ConnectionListener>) -> PoolResult<ReleaseOutcome> {
        self.check_owner(listener)?;
        if listener.is_destroyed() {
            return Ok(ReleaseOutcome::AlreadyDestroyed);
        }

        let errored = listener.has_error();
        let mut kill = errored || listener.is_marked_for_destroy() || self.is_shutdown();
        if !kill {
            if let Err(err) = listener.cleanup() {
                tracing::warn!(
                    pool = %self.name,
                    listener = listener.id(),
                    error = %err,
                    "cleanup failed, destroying connection"
                );
                kill = true;
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.checked_out.remove(&listener.id()).is_none() {
            drop(inner);
            if listener.is_destroyed() {
                return Ok(ReleaseOutcome::AlreadyDestroyed);
            }
            tracing::warn!(
                pool = %self.name,
                listener = listener.id(),
                "attempt to return a connection that is not checked out"
            );
            return Err(PoolError::InvalidHandle(listener.id()));
        }

        if !kill && listener.return_to_idle().is_err() {
            kill = true;
        }
        if kill {
            listener.mark_destroyed();
        } else {
            inner.idle.push_back(Arc::clone(listener));
        }
        let idle = inner.idle.len();
        drop(inner);
        self.return_permits(1);

        if kill {
            self.finish_destroy(listener);
            return Ok(ReleaseOutcome::Destroyed { errored });
        }
        tracing::debug!(
            pool = %self.name,
            listener = listener.id(),
            idle_count = idle,
            "returned connection to pool"
        );
        Ok(ReleaseOutcome::Idle)
    }

    /// Forcibly destroy a listener, leased or idle.
    ///
    /// Exactly one call per listener succeeds; later calls (for example a
    /// validation failure racing a caller's error report) get
    /// [`PoolError::DoubleRemoval`] and leave the accounting untouched.
    pub async fn remove(&self, listener: &Arc<ConnectionListener>) -> PoolResult<()> {
        self.check_owner(listener)?;
        let leased = {
            let mut inner = self.inner.lock().await;
            inner.detach(listener)
        };
        let Some(leased) = leased else {
            tracing::debug!(
                pool = %self.name,
                listener = listener.id(),
                "ignoring second removal of listener"
            );
            return Err(PoolError::DoubleRemoval {
                listener: listener.id(),
            });
        };
        if leased {
            self.return_permits(1);
        }
        self.finish_destroy(listener);
        tracing::debug!(pool = %self.name, listener = listener.id(), "listener removed");
        Ok(())
    }

    // ── Flush / fill ────────────────────────────────────────────

    /// Destroy listeners according to `mode`, then start a background
    /// refill to `min_size` if the pool keeps itself filled. Returns the
    /// number destroyed.
    pub async fn flush(self: &Arc<Self>, mode: FlushMode) -> usize {
        if mode == FlushMode::Invalid {
            let destroyed = self.validate_idle().await;
            self.trigger_prefill();
            return destroyed;
        }

        let (victims, leased) = {
            let mut inner = self.inner.lock().await;
            let mut victims: Vec<_> = inner.idle.drain(..).collect();
            let mut leased = 0;
            match mode {
                FlushMode::All => {
                    leased = inner.checked_out.len();
                    victims.extend(inner.checked_out.drain().map(|(_, l)| l));
                }
                FlushMode::Gracefully => {
                    for listener in inner.checked_out.values() {
                        listener.mark_for_destroy();
                    }
                }
                FlushMode::Idle | FlushMode::Invalid => {}
            }
            victims.retain(|l| l.mark_destroyed());
            (victims, leased)
        };
        if leased > 0 {
            self.return_permits(leased);
        }
        for listener in &victims {
            self.finish_destroy(listener);
        }
        if !victims.is_empty() {
            tracing::info!(
                pool = %self.name,
                ?mode,
                destroyed = victims.len(),
                "flushed connections"
            );
        }
        self.trigger_prefill();
        victims.len()
    }

    /// Create idle listeners under the default credential until the pool
    /// holds `target` listeners. Failures are logged and end the fill; the
    /// next background tick tries again. Returns the number created.
    pub async fn fill_to(&self, target: usize) -> usize {
        let target = target.min(self.config.max_size);
        let mut created = 0;
        loop {
            if self.is_shutdown() || self.size().await >= target {
                return created;
            }
            let permit = match tokio::time::timeout(
                self.config.blocking_timeout(),
                Arc::clone(&self.semaphore).acquire_owned(),
            )
            .await
            {
                Ok(Ok(permit)) => self.permit(permit),
                _ => return created,
            };
            {
                let mut inner = self.inner.lock().await;
                if inner.size() >= target {
                    return created;
                }
                inner.pending += 1;
            }

            let result = self.create_listener(
                self.default_credential.as_ref(),
                self.default_request_info.as_ref(),
            );
            let mut inner = self.inner.lock().await;
            inner.pending -= 1;
            match result {
                Ok(listener) if self.is_shutdown() => {
                    drop(inner);
                    listener.mark_destroyed();
                    self.finish_destroy(&listener);
                    return created;
                }
                Ok(listener) => {
                    inner.idle.push_back(listener);
                    created += 1;
                }
                Err(err) => {
                    drop(inner);
                    tracing::warn!(pool = %self.name, error = %err, "unable to fill pool");
                    return created;
                }
            }
            drop(inner);
            drop(permit);
        }
    }

    /// Fill to the configured startup size (`min_size` / `initial_size`).
    pub async fn prefill(&self) -> usize {
        let target = if self.config.prefill || self.config.strict_min {
            self.config.startup_size()
        } else {
            self.config.initial_size
        };
        if target == 0 {
            return 0;
        }
        let created = self.fill_to(target).await;
        tracing::info!(pool = %self.name, created, target, "pool prefilled");
        created
    }

    /// Start a background fill to `min_size` unless one is already running.
    /// Callers never wait on the factory for replenishment.
    pub(crate) fn trigger_prefill(self: &Arc<Self>) {
        if !self.config.fills_to_min() || self.is_shutdown() {
            return;
        }
        if self.filling.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.fill_to(pool.config.min_size).await;
            pool.filling.store(false, Ordering::Release);
        });
    }

    // ── Background maintenance ─────────────────────────────────

    /// Destroy listeners idle longer than `idle_timeout`. With `strict_min`
    /// the pool never shrinks below `min_size`. Starts a background refill
    /// when the pool keeps itself filled. Returns the number reaped.
    pub async fn remove_idle(self: &Arc<Self>) -> usize {
        let timeout = self.config.idle_timeout();
        let now = Instant::now();
        let mut reaped = 0;
        loop {
            let victim = {
                let mut inner = self.inner.lock().await;
                if self.config.strict_min && inner.size() <= self.config.min_size {
                    break;
                }
                let Some(pos) = inner.idle.iter().position(|l| l.idle_for(now) >= timeout) else {
                    break;
                };
                inner.idle.remove(pos).filter(|l| l.mark_destroyed())
            };
            let Some(victim) = victim else {
                continue;
            };
            self.finish_destroy(&victim);
            reaped += 1;
        }

        if reaped > 0 {
            self.statistics.record_timed_out(reaped as u64);
            let remaining = self.size().await;
            tracing::info!(
                pool = %self.name,
                reaped,
                remaining,
                "reaped idle connections"
            );
        }
        self.trigger_prefill();
        reaped
    }

    /// Validate idle listeners one at a time, destroying invalid ones.
    /// Listeners are validated outside the pool lock while holding a permit.
    /// Returns the number destroyed.
    pub async fn validate_idle(&self) -> usize {
        let ids: Vec<u64> = self.inner.lock().await.idle.iter().map(|l| l.id()).collect();
        let mut destroyed = 0;
        for id in ids {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let permit = self.permit(permit);
            let candidate = {
                let mut inner = self.inner.lock().await;
                match inner.idle.iter().position(|l| l.id() == id) {
                    Some(pos) => {
                        inner.pending += 1;
                        inner.idle.remove(pos)
                    }
                    None => None,
                }
            };
            let Some(candidate) = candidate else {
                continue;
            };

            let valid = self.validate(&candidate);
            let discard = {
                let mut inner = self.inner.lock().await;
                inner.pending -= 1;
                if candidate.is_destroyed() {
                    false
                } else if valid {
                    inner.idle.push_front(Arc::clone(&candidate));
                    false
                } else {
                    candidate.mark_destroyed()
                }
            };
            drop(permit);
            if discard {
                tracing::warn!(
                    pool = %self.name,
                    listener = candidate.id(),
                    "destroying idle connection that failed background validation"
                );
                self.finish_destroy(&candidate);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Refuse new acquires, wake blocked callers, and destroy everything.
    pub async fn shutdown(self: &Arc<Self>) -> usize {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.semaphore.close();
        self.permit_released.notify_waiters();
        let active = self.active_count().await;
        if active > 0 {
            tracing::warn!(pool = %self.name, active, "destroying active connections on shutdown");
        }
        let destroyed = self.flush(FlushMode::All).await;
        tracing::info!(pool = %self.name, destroyed, "pool shut down");
        destroyed
    }

    // ── Accessors ───────────────────────────────────────────────

    /// Leased listeners.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.checked_out.len()
    }

    pub async fn idle_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    /// `active + idle`, plus creations and validations in flight.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.size()
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    pub async fn is_full(&self) -> bool {
        self.size().await >= self.config.max_size
    }

    pub async fn statistics(&self) -> StatisticsSnapshot {
        let inner = self.inner.lock().await;
        self.statistics.snapshot(inner.checked_out.len(), inner.idle.len())
    }
}

impl std::fmt::Debug for ManagedConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnectionPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("max_size", &self.config.max_size)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
