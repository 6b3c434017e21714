use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::Rng;
use serde::Serialize;
use tracing::info;

use ironpool::{ConnectionManager, IdleRemover, Pool, StatisticsSnapshot};
use ironpool_core::{
    ConnectionFactory, Credential, FactoryError, NoTransactions, PhysicalConnection, PoolConfig,
    PoolError, RequestInfo, StaticSecurity,
};

#[derive(Clone, Copy, Debug)]
pub struct SimulateOptions {
    pub workers: usize,
    pub iterations: usize,
    pub fail_rate: f64,
    pub hold_millis: u64,
}

/// In-process stand-in for a backend; creation fails with `fail_rate`.
struct SimFactory {
    fail_rate: f64,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct SimConnection {
    id: u64,
}

impl PhysicalConnection for SimConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn destroy(&mut self) {}
}

impl ConnectionFactory for SimFactory {
    fn create(
        &self,
        _credential: Option<&Credential>,
        _request_info: Option<&RequestInfo>,
    ) -> Result<Box<dyn PhysicalConnection>, FactoryError> {
        if self.fail_rate > 0.0 && rand::thread_rng().gen_bool(self.fail_rate) {
            return Err(FactoryError::retryable("simulated backend failure"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SimConnection { id }))
    }
}

#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    pub workers: usize,
    pub iterations: usize,
    pub allocated: u64,
    pub exhausted: u64,
    pub creation_failures: u64,
    pub elapsed_ms: u64,
    pub statistics: StatisticsSnapshot,
}

#[derive(Default)]
struct Outcomes {
    allocated: AtomicU64,
    exhausted: AtomicU64,
    creation_failures: AtomicU64,
}

pub async fn simulate(
    config_path: Option<&Path>,
    options: SimulateOptions,
    format: &str,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => PoolConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PoolConfig::default(),
    };
    let report = run(config, options).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("{}", format_report(&report));
        }
    }
    Ok(())
}

pub async fn run(config: PoolConfig, options: SimulateOptions) -> anyhow::Result<SimulationReport> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&options.fail_rate),
        "fail rate must be between 0.0 and 1.0, got {}",
        options.fail_rate
    );

    let factory = Arc::new(SimFactory {
        fail_rate: options.fail_rate,
        next_id: AtomicU64::new(1),
    });
    let pool = Arc::new(Pool::new(config, factory)?);
    pool.prefill().await?;
    let remover = IdleRemover::spawn_for(Arc::clone(&pool));
    let manager = ConnectionManager::new(
        Arc::clone(&pool),
        StaticSecurity::new(None).into_shared(),
        Arc::new(NoTransactions),
    );

    info!(
        pool = %pool.name(),
        workers = options.workers,
        iterations = options.iterations,
        "starting simulation"
    );
    let started = Instant::now();
    let outcomes = Arc::new(Outcomes::default());
    let hold = Duration::from_millis(options.hold_millis);

    let tasks: Vec<_> = (0..options.workers)
        .map(|_| {
            let manager = manager.clone();
            let outcomes = Arc::clone(&outcomes);
            tokio::spawn(async move {
                for _ in 0..options.iterations {
                    match manager.allocate_connection(None).await {
                        Ok(mut handle) => {
                            outcomes.allocated.fetch_add(1, Ordering::Relaxed);
                            tokio::time::sleep(hold).await;
                            handle.close().await?;
                        }
                        Err(PoolError::PoolExhausted { .. }) => {
                            outcomes.exhausted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(PoolError::CreationFailed { .. }) => {
                            outcomes.creation_failures.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            })
        })
        .collect();
    for task in tasks {
        task.await??;
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let statistics = manager.statistics().await;
    remover.stop().await;
    manager.shutdown().await;

    Ok(SimulationReport {
        workers: options.workers,
        iterations: options.iterations,
        allocated: outcomes.allocated.load(Ordering::Relaxed),
        exhausted: outcomes.exhausted.load(Ordering::Relaxed),
        creation_failures: outcomes.creation_failures.load(Ordering::Relaxed),
        elapsed_ms,
        statistics,
    })
}

fn format_report(report: &SimulationReport) -> String {
    let stats = &report.statistics;
    let mut out = String::new();
    out.push_str(&format!(
        "Simulation: {} workers × {} iterations in {} ms\n",
        report.workers, report.iterations, report.elapsed_ms
    ));
    out.push_str(&format!(
        "  allocated:          {}\n  exhausted:          {}\n  creation failures:  {}\n",
        report.allocated, report.exhausted, report.creation_failures
    ));
    out.push_str("\nPool statistics:\n");
    out.push_str(&format!(
        "  created: {}  destroyed: {}  timed out: {}\n",
        stats.created, stats.destroyed, stats.timed_out
    ));
    out.push_str(&format!(
        "  active: {}  idle: {}  max used: {}\n",
        stats.active, stats.idle, stats.max_used
    ));
    out.push_str(&format!(
        "  waits: {}  blocking failures: {}  max wait: {} ms  avg creation: {} ms\n",
        stats.wait_count,
        stats.blocking_failures,
        stats.max_wait_ms,
        stats.average_creation_ms()
    ));
    out.push_str("  wait histogram (ms):");
    let bounds = ironpool::WAIT_BUCKETS_MS
        .iter()
        .map(|b| format!("≤{b}"))
        .chain(std::iter::once("more".to_string()));
    for (label, count) in bounds.zip(&stats.wait_histogram) {
        out.push_str(&format!(" {label}:{count}"));
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(workers: usize, iterations: usize, fail_rate: f64) -> SimulateOptions {
        SimulateOptions {
            workers,
            iterations,
            fail_rate,
            hold_millis: 0,
        }
    }

    fn small_pool() -> PoolConfig {
        PoolConfig {
            name: "sim".to_string(),
            max_size: 3,
            blocking_timeout_millis: 5_000,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn healthy_run_allocates_every_iteration() {
        let report = run(small_pool(), options(4, 10, 0.0)).await.unwrap();
        assert_eq!(report.allocated, 40);
        assert_eq!(report.exhausted, 0);
        assert_eq!(report.creation_failures, 0);
        assert!(report.statistics.created <= 3);
        assert!(report.statistics.max_used <= 3);
    }

    #[tokio::test]
    async fn always_failing_backend_reports_failures() {
        let report = run(small_pool(), options(2, 5, 1.0)).await.unwrap();
        assert_eq!(report.allocated, 0);
        assert_eq!(report.creation_failures, 10);
    }

    #[tokio::test]
    async fn rejects_out_of_range_fail_rate() {
        assert!(run(small_pool(), options(1, 1, 1.5)).await.is_err());
    }

    #[test]
    fn text_report_lists_histogram() {
        let report = SimulationReport {
            statistics: StatisticsSnapshot {
                wait_histogram: vec![0; ironpool::WAIT_BUCKETS_MS.len() + 1],
                ..StatisticsSnapshot::default()
            },
            ..SimulationReport::default()
        };
        let text = format_report(&report);
        assert!(text.contains("≤1:0"));
        assert!(text.contains("more:0"));
    }

    #[test]
    fn report_serializes_to_json() {
        let json = serde_json::to_value(SimulationReport::default()).unwrap();
        assert_eq!(json["allocated"], 0);
        assert!(json["statistics"].is_object());
    }
}
