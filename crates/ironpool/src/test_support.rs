//! Mock collaborators shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use ironpool_core::{
    ConnectionFactory, Credential, EnlistError, EnlistResource, FactoryError, PhysicalConnection,
    RequestInfo, TransactionContext, XaResource,
};

static TRACING_INIT: Once = Once::new();

/// Route pool logs to the test writer. Controlled by `RUST_LOG`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug)]
pub struct MockXa(pub String);

impl XaResource for MockXa {
    fn resource_id(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    healthy: Arc<AtomicBool>,
    cleanup_fails: bool,
    destroyed: bool,
    destroy_count: Option<Arc<AtomicU64>>,
    xa: Option<Arc<dyn XaResource>>,
}

impl MockConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            healthy: Arc::new(AtomicBool::new(true)),
            cleanup_fails: false,
            destroyed: false,
            destroy_count: None,
            xa: None,
        }
    }

    pub fn with_xa(mut self, resource_id: &str) -> Self {
        self.xa = Some(Arc::new(MockXa(resource_id.to_string())));
        self
    }
}

impl PhysicalConnection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_valid(&self) -> bool {
        !self.destroyed && self.healthy.load(Ordering::Relaxed)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Some(count) = &self.destroy_count {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn cleanup(&mut self) -> Result<(), FactoryError> {
        if self.cleanup_fails {
            return Err(FactoryError::fatal("cleanup failed"));
        }
        Ok(())
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.xa.clone()
    }
}

/// Factory whose failures and connection health can be flipped at runtime.
pub struct MockFactory {
    next_id: AtomicU64,
    pub create_count: AtomicU64,
    pub destroy_count: Arc<AtomicU64>,
    /// Creation fails and every connection reports invalid.
    pub failing: AtomicBool,
    /// Connections created from now on report invalid.
    pub healthy: Arc<AtomicBool>,
    pub retryable: AtomicBool,
    pub cleanup_fails: AtomicBool,
    pub xa: AtomicBool,
    pub create_delay: Mutex<Option<Duration>>,
    pub credentials: Mutex<Vec<Option<Credential>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            create_count: AtomicU64::new(0),
            destroy_count: Arc::new(AtomicU64::new(0)),
            failing: AtomicBool::new(false),
            healthy: Arc::new(AtomicBool::new(true)),
            retryable: AtomicBool::new(true),
            cleanup_fails: AtomicBool::new(false),
            xa: AtomicBool::new(false),
            create_delay: Mutex::new(None),
            credentials: Mutex::new(Vec::new()),
        }
    }

    pub fn creates(&self) -> u64 {
        self.create_count.load(Ordering::Relaxed)
    }

    pub fn destroys(&self) -> u64 {
        self.destroy_count.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

impl ConnectionFactory for MockFactory {
    fn create(
        &self,
        credential: Option<&Credential>,
        _request_info: Option<&RequestInfo>,
    ) -> Result<Box<dyn PhysicalConnection>, FactoryError> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(FactoryError {
                retryable: self.retryable.load(Ordering::Relaxed),
                message: "connection refused".to_string(),
            });
        }
        self.create_count.fetch_add(1, Ordering::Relaxed);
        self.credentials.lock().unwrap().push(credential.cloned());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conn = MockConnection::new(id);
        conn.healthy = Arc::clone(&self.healthy);
        conn.cleanup_fails = self.cleanup_fails.load(Ordering::Relaxed);
        conn.destroy_count = Some(Arc::clone(&self.destroy_count));
        if self.xa.load(Ordering::Relaxed) {
            conn = conn.with_xa(&format!("rm-{id}"));
        }
        Ok(Box::new(conn))
    }

    fn is_valid(&self, connection: &dyn PhysicalConnection) -> bool {
        !self.failing.load(Ordering::Relaxed) && connection.is_valid()
    }
}

/// Transaction that records enlist/delist calls.
pub struct RecordingTransaction {
    id: String,
    reject: bool,
    enlisted: Mutex<Vec<u64>>,
    delisted: Mutex<Vec<(u64, bool)>>,
    xa_resources: Mutex<Vec<String>>,
}

impl RecordingTransaction {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            reject: false,
            enlisted: Mutex::new(Vec::new()),
            delisted: Mutex::new(Vec::new()),
            xa_resources: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(id: &str) -> Self {
        Self {
            reject: true,
            ..Self::new(id)
        }
    }

    pub fn enlisted(&self) -> Vec<u64> {
        self.enlisted.lock().unwrap().clone()
    }

    pub fn delisted(&self) -> Vec<(u64, bool)> {
        self.delisted.lock().unwrap().clone()
    }

    pub fn xa_resources(&self) -> Vec<String> {
        self.xa_resources.lock().unwrap().clone()
    }
}

impl TransactionContext for RecordingTransaction {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn enlist(&self, listener_id: u64, resource: &EnlistResource) -> Result<(), EnlistError> {
        if self.reject {
            return Err(EnlistError::new("coordinator rejected resource"));
        }
        if let EnlistResource::Xa(xa) = resource {
            self.xa_resources.lock().unwrap().push(xa.resource_id());
        }
        self.enlisted.lock().unwrap().push(listener_id);
        Ok(())
    }

    fn delist(&self, listener_id: u64, success: bool) {
        self.delisted.lock().unwrap().push((listener_id, success));
    }
}
