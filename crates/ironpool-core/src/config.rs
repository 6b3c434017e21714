//! Pool configuration: typed fields, explicit defaults, TOML loading.
//!
//! ```toml
//! name = "orders-db"
//! min_size = 2
//! max_size = 20
//! blocking_timeout_millis = 30000
//! idle_timeout_minutes = 30
//! prefill = true
//! use_fast_fail = true
//! flush_strategy = "IdleConnections"
//! strategy = "PoolBySubject"
//! transaction_support = "XaTransaction"
//! interleaving = false
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;

/// How credentials map onto managed connection pools.
///
/// Chosen once at configuration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolStrategy {
    /// A single shared pool; credentials only affect listener matching.
    #[default]
    OnePool,
    /// One pool per distinct connection-request info.
    PoolByCri,
    /// One pool per distinct credential.
    PoolBySubject,
    /// One pool per distinct (credential, request info) pair.
    PoolBySubjectAndCri,
}

impl fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolStrategy::OnePool => write!(f, "one-pool"),
            PoolStrategy::PoolByCri => write!(f, "pool-by-cri"),
            PoolStrategy::PoolBySubject => write!(f, "pool-by-subject"),
            PoolStrategy::PoolBySubjectAndCri => write!(f, "pool-by-subject-and-cri"),
        }
    }
}

/// Which sibling connections to discard when one reports an error.
///
/// The plain variants act on the failing connection's own managed pool;
/// the `All*` variants act on every managed pool of the strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushStrategy {
    #[default]
    FailingConnectionOnly,
    InvalidIdleConnections,
    IdleConnections,
    Gracefully,
    EntirePool,
    AllInvalidIdleConnections,
    AllIdleConnections,
    AllGracefully,
    AllConnections,
}

impl FlushStrategy {
    /// Whether the strategy spans every managed pool rather than the
    /// failing connection's own.
    pub fn is_pool_wide(&self) -> bool {
        matches!(
            self,
            FlushStrategy::AllInvalidIdleConnections
                | FlushStrategy::AllIdleConnections
                | FlushStrategy::AllGracefully
                | FlushStrategy::AllConnections
        )
    }
}

/// Transaction model of the listeners a pool creates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionSupport {
    #[default]
    NoTransaction,
    LocalTransaction,
    XaTransaction,
}

/// Configuration for a connection pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name used in logs and statistics (default: "default").
    pub name: String,
    /// Target minimum of connections per managed pool (default: 0).
    pub min_size: usize,
    /// Connections created when the pool starts, if prefilling (default: 0).
    pub initial_size: usize,
    /// Hard upper bound on `active + idle` per managed pool (default: 20).
    pub max_size: usize,
    /// Maximum wait for a connection when the pool is full (default: 30000ms).
    pub blocking_timeout_millis: u64,
    /// Idle connections older than this are reaped (default: 30 minutes).
    pub idle_timeout_minutes: u64,
    /// Create `min_size` connections eagerly (default: false).
    pub prefill: bool,
    /// Never shrink below `min_size`, even on idle timeout (default: false).
    pub strict_min: bool,
    /// Serve blocked callers in arrival order (default: true).
    pub fair: bool,
    /// Validate idle connections from the background task (default: false).
    pub background_validation: bool,
    /// Background validation period in milliseconds (default: 0).
    pub background_validation_millis: u64,
    /// Validate an idle connection before handing it out (default: false).
    pub validate_on_match: bool,
    /// Skip waiting once the backing resource is known to be down (default: false).
    pub use_fast_fail: bool,
    /// Sibling destruction policy on connection error.
    pub flush_strategy: FlushStrategy,
    /// Credential partitioning policy.
    pub strategy: PoolStrategy,
    /// Transaction model of created listeners.
    pub transaction_support: TransactionSupport,
    /// Let one transaction hold several listeners of the same managed pool
    /// and credential. When false, a second allocation inside a transaction
    /// reuses the listener already enlisted in it (default: false).
    pub interleaving: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 0,
            initial_size: 0,
            max_size: 20,
            blocking_timeout_millis: 30_000,
            idle_timeout_minutes: 30,
            prefill: false,
            strict_min: false,
            fair: true,
            background_validation: false,
            background_validation_millis: 0,
            validate_on_match: false,
            use_fast_fail: false,
            flush_strategy: FlushStrategy::default(),
            strategy: PoolStrategy::default(),
            transaction_support: TransactionSupport::default(),
            interleaving: false,
        }
    }
}

impl PoolConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, PoolError> {
        let config: PoolConfig =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the pool cannot honour.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Config("max_size must be at least 1".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.initial_size > self.max_size {
            return Err(PoolError::Config(format!(
                "initial_size ({}) exceeds max_size ({})",
                self.initial_size, self.max_size
            )));
        }
        if self.background_validation && self.background_validation_millis == 0 {
            return Err(PoolError::Config(
                "background_validation requires background_validation_millis > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_millis)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn background_validation_interval(&self) -> Option<Duration> {
        (self.background_validation && self.background_validation_millis > 0)
            .then(|| Duration::from_millis(self.background_validation_millis))
    }

    /// Whether the pool should keep itself filled to `min_size`.
    pub fn fills_to_min(&self) -> bool {
        (self.prefill || self.strict_min) && self.min_size > 0
    }

    /// Size the pool fills to when it first starts.
    pub fn startup_size(&self) -> usize {
        self.min_size.max(self.initial_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 0);
        assert_eq!(config.max_size, 20);
        assert_eq!(config.blocking_timeout(), Duration::from_millis(30_000));
        assert_eq!(config.idle_timeout(), Duration::from_secs(30 * 60));
        assert!(config.fair);
        assert!(!config.use_fast_fail);
        assert_eq!(config.flush_strategy, FlushStrategy::FailingConnectionOnly);
        assert_eq!(config.strategy, PoolStrategy::OnePool);
        assert_eq!(config.transaction_support, TransactionSupport::NoTransaction);
        assert!(!config.interleaving);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let config = PoolConfig::from_toml_str(
            r#"
name = "orders"
max_size = 5
use_fast_fail = true
flush_strategy = "EntirePool"
strategy = "PoolBySubject"
"#,
        )
        .unwrap();

        assert_eq!(config.name, "orders");
        assert_eq!(config.max_size, 5);
        assert!(config.use_fast_fail);
        assert_eq!(config.flush_strategy, FlushStrategy::EntirePool);
        assert_eq!(config.strategy, PoolStrategy::PoolBySubject);
        assert_eq!(config.idle_timeout_minutes, 30);
    }

    #[test]
    fn parse_rejects_unknown_strategy() {
        let result = PoolConfig::from_toml_str(r#"strategy = "PoolByPhaseOfMoon""#);
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_max() {
        let config = PoolConfig {
            max_size: 0,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_min_above_max() {
        let config = PoolConfig {
            min_size: 5,
            max_size: 2,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn validate_rejects_background_validation_without_interval() {
        let config = PoolConfig {
            background_validation: true,
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.background_validation_interval().is_none());
    }

    #[test]
    fn toml_round_trip_preserves_enums() {
        let config = PoolConfig {
            flush_strategy: FlushStrategy::AllIdleConnections,
            transaction_support: TransactionSupport::XaTransaction,
            ..PoolConfig::default()
        };
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("AllIdleConnections"));
        assert_eq!(PoolConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn pool_wide_flush_strategies() {
        assert!(FlushStrategy::AllConnections.is_pool_wide());
        assert!(!FlushStrategy::EntirePool.is_pool_wide());
        assert!(!FlushStrategy::FailingConnectionOnly.is_pool_wide());
    }

    #[test]
    fn fills_to_min_requires_prefill_or_strict() {
        let mut config = PoolConfig {
            min_size: 3,
            ..PoolConfig::default()
        };
        assert!(!config.fills_to_min());
        config.strict_min = true;
        assert!(config.fills_to_min());
        config.min_size = 0;
        assert!(!config.fills_to_min());
    }

    #[test]
    fn strategy_display() {
        assert_eq!(PoolStrategy::PoolBySubject.to_string(), "pool-by-subject");
        assert_eq!(PoolStrategy::OnePool.to_string(), "one-pool");
    }
}
