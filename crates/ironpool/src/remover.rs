//! Idle remover: background task that reaps and validates idle listeners.
//!
//! Each tick runs [`Pool::remove_idle`] and, when background validation is
//! configured, [`Pool::validate`]. Failures inside a tick are logged by the
//! pool and never surface here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pool::Pool;

/// Handle to a running idle-remover task.
pub struct IdleRemover {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl IdleRemover {
    /// Spawn the remover on the current runtime, ticking every `interval`.
    pub fn spawn(pool: Arc<Pool>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let validation = pool.config().background_validation_interval().is_some();
        info!(
            pool = %pool.name(),
            ?interval,
            validation,
            "idle remover started"
        );
        let handle = tokio::spawn(run_remover_loop(pool, interval, validation, shutdown_rx));
        Self {
            handle,
            shutdown_tx,
        }
    }

    /// Spawn with the interval derived from the pool's configuration: the
    /// shorter of the idle timeout and the background validation interval.
    pub fn spawn_for(pool: Arc<Pool>) -> Self {
        let config = pool.config();
        let mut interval = config.idle_timeout();
        if let Some(validation) = config.background_validation_interval() {
            interval = interval.min(validation);
        }
        if interval.is_zero() {
            interval = Duration::from_secs(1);
        }
        Self::spawn(pool, interval)
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
        debug!("idle remover stopped");
    }
}

async fn run_remover_loop(
    pool: Arc<Pool>,
    interval: Duration,
    validation: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if pool.is_shutdown() {
                    break;
                }
                let reaped = pool.remove_idle().await;
                let invalid = if validation { pool.validate().await } else { 0 };
                if reaped > 0 || invalid > 0 {
                    debug!(pool = %pool.name(), reaped, invalid, "idle remover tick");
                }
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
    debug!(pool = %pool.name(), "idle remover loop exiting");
}
