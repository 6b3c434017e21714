//! Pool strategy: maps (credential, request info) onto managed pools.
//!
//! Each strategy decides which part of the request becomes the partition
//! key. Managed pools are created lazily on first use and share one
//! listener id sequence, so listener ids are unique across the strategy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::RwLock;

use ironpool_core::{
    ConnectionFactory, Credential, FlushStrategy, PoolConfig, PoolError, PoolResult, PoolStrategy,
    RequestInfo,
};

use crate::listener::ConnectionListener;
use crate::managed::{FlushMode, ManagedConnectionPool, ReleaseOutcome};
use crate::stats::StatisticsSnapshot;

/// Partition key of one managed pool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SubPoolKey {
    pub credential: Option<Credential>,
    pub request_info: Option<RequestInfo>,
}

impl SubPoolKey {
    /// Derive the key for a request under `strategy`.
    pub fn for_request(
        strategy: PoolStrategy,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> Self {
        let (credential, request_info) = match strategy {
            PoolStrategy::OnePool => (None, None),
            PoolStrategy::PoolBySubject => (credential, None),
            PoolStrategy::PoolByCri => (None, request_info),
            PoolStrategy::PoolBySubjectAndCri => (credential, request_info),
        };
        Self {
            credential: credential.cloned(),
            request_info: request_info.cloned(),
        }
    }

    fn is_default(&self) -> bool {
        self.credential.is_none() && self.request_info.is_none()
    }
}

impl fmt::Display for SubPoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.credential, &self.request_info) {
            (None, None) => write!(f, "default"),
            (Some(c), None) => write!(f, "{c}"),
            (None, Some(r)) => write!(f, "{r}"),
            (Some(c), Some(r)) => write!(f, "{c}/{r}"),
        }
    }
}

/// A leased listener together with the managed pool it came from.
#[derive(Clone, Debug)]
pub struct Lease {
    pool: Arc<ManagedConnectionPool>,
    listener: Arc<ConnectionListener>,
}

impl Lease {
    pub fn listener(&self) -> &Arc<ConnectionListener> {
        &self.listener
    }

    pub fn pool(&self) -> &Arc<ManagedConnectionPool> {
        &self.pool
    }

    pub fn id(&self) -> u64 {
        self.listener.id()
    }
}

/// Strategy-level pool: owns the managed pools for one connection factory.
pub struct Pool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    pools: RwLock<HashMap<SubPoolKey, Arc<ManagedConnectionPool>>>,
    next_pool_id: AtomicU64,
    listener_ids: Arc<AtomicU64>,
    shutdown: AtomicBool,
}

impl Pool {
    /// Build a pool after validating `config`.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> PoolResult<Self> {
        config.validate()?;
        tracing::info!(
            pool = %config.name,
            strategy = %config.strategy,
            max_size = config.max_size,
            flush_strategy = ?config.flush_strategy,
            "connection pool configured"
        );
        Ok(Self {
            config,
            factory,
            pools: RwLock::new(HashMap::new()),
            next_pool_id: AtomicU64::new(1),
            listener_ids: Arc::new(AtomicU64::new(1)),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn strategy(&self) -> PoolStrategy {
        self.config.strategy
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The managed pool serving `credential` / `request_info`, created on
    /// first use.
    pub async fn managed_pool(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<Arc<ManagedConnectionPool>> {
        if self.is_shutdown() {
            return Err(PoolError::Shutdown(self.config.name.clone()));
        }
        let key = SubPoolKey::for_request(self.config.strategy, credential, request_info);

        if let Some(pool) = self.pools.read().await.get(&key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(Arc::clone(pool));
        }
        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}[{}]", self.config.name, key);
        let pool = Arc::new(
            ManagedConnectionPool::new(id, self.config.clone(), Arc::clone(&self.factory))
                .with_name(name)
                .with_defaults(key.credential.clone(), key.request_info.clone())
                .with_listener_ids(Arc::clone(&self.listener_ids)),
        );
        tracing::debug!(pool = %pool.name(), "created managed pool");
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    /// Lease a listener for the given credential and request info.
    pub async fn get_connection(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<Lease> {
        let pool = self.managed_pool(credential, request_info).await?;
        let listener = pool.acquire(credential, request_info).await?;
        Ok(Lease { pool, listener })
    }

    /// Return a lease. With `kill` the listener is flagged as errored and
    /// destroyed; destroying an errored listener applies the flush strategy.
    pub async fn return_connection(&self, lease: &Lease, kill: bool) -> PoolResult<ReleaseOutcome> {
        if kill {
            lease.listener.set_error();
        }
        let outcome = lease.pool.release(&lease.listener).await?;
        if outcome == (ReleaseOutcome::Destroyed { errored: true }) {
            self.apply_flush_strategy(&lease.pool).await;
        }
        Ok(outcome)
    }

    /// A caller observed a broken connection: destroy it now and apply the
    /// flush strategy. A listener already removed by another path yields
    /// `DoubleRemoval` and triggers no further flushing.
    pub async fn connection_error(&self, lease: &Lease) -> PoolResult<()> {
        lease.listener.set_error();
        lease.pool.remove(&lease.listener).await?;
        tracing::warn!(
            pool = %lease.pool.name(),
            listener = lease.listener.id(),
            "connection error reported, listener destroyed"
        );
        self.apply_flush_strategy(&lease.pool).await;
        Ok(())
    }

    async fn apply_flush_strategy(&self, origin: &Arc<ManagedConnectionPool>) {
        let strategy = self.config.flush_strategy;
        let mode = match strategy {
            FlushStrategy::FailingConnectionOnly => {
                origin.trigger_prefill();
                return;
            }
            FlushStrategy::InvalidIdleConnections | FlushStrategy::AllInvalidIdleConnections => {
                FlushMode::Invalid
            }
            FlushStrategy::IdleConnections | FlushStrategy::AllIdleConnections => FlushMode::Idle,
            FlushStrategy::Gracefully | FlushStrategy::AllGracefully => FlushMode::Gracefully,
            FlushStrategy::EntirePool | FlushStrategy::AllConnections => FlushMode::All,
        };
        tracing::debug!(pool = %origin.name(), ?strategy, "applying flush strategy");
        if strategy.is_pool_wide() {
            self.flush(mode).await;
        } else {
            origin.flush(mode).await;
        }
    }

    async fn managed_pools(&self) -> Vec<Arc<ManagedConnectionPool>> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Flush every managed pool. Returns the number of listeners destroyed.
    pub async fn flush(&self, mode: FlushMode) -> usize {
        let mut destroyed = 0;
        for pool in self.managed_pools().await {
            destroyed += pool.flush(mode).await;
        }
        destroyed
    }

    /// Fill the default managed pool to its startup size.
    ///
    /// Under `PoolBySubject`, `PoolByCri` and `PoolBySubjectAndCri` the
    /// default managed pool only serves callers presenting neither a
    /// credential nor request info. Use [`Pool::prefill_for`] to warm the
    /// managed pool of a specific key.
    pub async fn prefill(&self) -> PoolResult<usize> {
        self.prefill_for(None, None).await
    }

    /// Fill the managed pool serving `credential` / `request_info` to its
    /// startup size, creating that managed pool if needed.
    pub async fn prefill_for(
        &self,
        credential: Option<&Credential>,
        request_info: Option<&RequestInfo>,
    ) -> PoolResult<usize> {
        let pool = self.managed_pool(credential, request_info).await?;
        Ok(pool.prefill().await)
    }

    /// Reap idle listeners in every managed pool, then drop managed pools
    /// left empty (the single pool of `OnePool` is kept).
    pub async fn remove_idle(&self) -> usize {
        let mut reaped = 0;
        for pool in self.managed_pools().await {
            reaped += pool.remove_idle().await;
        }
        if self.config.strategy != PoolStrategy::OnePool {
            self.drop_empty_pools().await;
        }
        reaped
    }

    /// Drop empty managed pools that nothing outside the map references.
    /// A managed pool a caller still holds (from `managed_pool`, a lease or
    /// a background fill) stays registered, so one key never maps to two
    /// live managed pools.
    async fn drop_empty_pools(&self) {
        let mut pools = self.pools.write().await;
        let mut empty = Vec::new();
        for (key, pool) in pools.iter() {
            if key.is_default() || Arc::strong_count(pool) > 1 {
                continue;
            }
            if pool.is_empty().await {
                empty.push(key.clone());
            }
        }
        for key in empty {
            if let Some(pool) = pools.remove(&key) {
                tracing::debug!(pool = %pool.name(), "dropped empty managed pool");
            }
        }
    }

    /// Background validation across every managed pool. Returns the number
    /// of listeners destroyed.
    pub async fn validate(&self) -> usize {
        let mut destroyed = 0;
        for pool in self.managed_pools().await {
            destroyed += pool.validate_idle().await;
        }
        destroyed
    }

    /// Aggregate statistics over every managed pool.
    pub async fn statistics(&self) -> StatisticsSnapshot {
        let mut total = StatisticsSnapshot::default();
        for pool in self.managed_pools().await {
            total.merge(&pool.statistics().await);
        }
        total
    }

    pub async fn sub_pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Shut down every managed pool and refuse further requests.
    pub async fn shutdown(&self) -> usize {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let pools: Vec<_> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        let mut destroyed = 0;
        for pool in pools {
            destroyed += pool.shutdown().await;
        }
        tracing::info!(pool = %self.config.name, destroyed, "connection pool shut down");
        destroyed
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.name)
            .field("strategy", &self.config.strategy)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}
