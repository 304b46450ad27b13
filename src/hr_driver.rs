// Restart test driver
//
// Brings up the cluster, starts the monitor and the client workers, then
// stops and restarts the cluster `iteration_count` times while the workers
// keep writing. Teardown always runs: workers, sampler, cluster, work
// directory, in that order.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::hr_cluster::{ensure_active, start_cluster, stop_cluster, ClusterHandle};
use crate::hr_config::{ConfigError, HarnessConfig};
use crate::hr_interface::{CacheError, ClientConnector, ClusterError, ClusterService, SampleSink};
use crate::hr_monitor::ThroughputMonitor;
use crate::hr_workdir::WorkDir;
use crate::hr_workers::{WorkerPool, WorkerReport};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to prepare work directory {path}: {source}")]
    WorkDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("client {index} could not connect: {source}")]
    Client {
        index: usize,
        #[source]
        source: CacheError,
    },

    #[error("unable to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),
}

// ============================================================================
// Run report
// ============================================================================

/// What one run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub config_summary: String,
    pub iterations_completed: usize,
    pub restarts: usize,
    pub workers_spawned: usize,
    /// Live worker threads observed right after each restart
    pub live_workers_after_restart: Vec<usize>,
    /// Starts after which the cluster had to be moved to ACTIVE
    pub promotions: usize,
    pub total_operations: u64,
    pub write_failures: u64,
    pub samples_emitted: u64,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn print_summary(&self) {
        println!("\n╔════════════════════════════════════════════════════════╗");
        println!("║    HOT RESTART RUN RESULTS                             ║");
        println!("╚════════════════════════════════════════════════════════╝\n");

        println!("Configuration: {}", self.config_summary);
        println!("Elapsed: {:.1}s", self.elapsed.as_secs_f64());
        println!();

        println!("═══ Restarts ═══");
        println!("  Iterations: {}", self.iterations_completed);
        println!("  Restarts: {}", self.restarts);
        println!("  Live workers after restart: {:?}", self.live_workers_after_restart);
        println!("  Promotions to ACTIVE: {}", self.promotions);
        println!();

        println!("═══ Load ═══");
        println!("  Workers: {}", self.workers_spawned);
        println!("  Operations: {}", self.total_operations);
        println!("  Failed writes: {}", self.write_failures);
        if self.elapsed.as_secs_f64() > 0.0 {
            println!(
                "  Average: {:.1} ops/s",
                self.total_operations as f64 / self.elapsed.as_secs_f64()
            );
        }
        println!("  Samples: {}", self.samples_emitted);
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct HarnessDriver<G> {
    config: HarnessConfig,
    grid: Arc<G>,
}

impl<G> HarnessDriver<G>
where
    G: ClusterService + ClientConnector,
{
    pub fn new(config: HarnessConfig, grid: Arc<G>) -> Self {
        Self { config, grid }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Run the whole test and tear everything down
    pub fn run<K: SampleSink + 'static>(&self, sink: K) -> Result<RunReport, HarnessError> {
        self.config.validate()?;
        info!("restart run: {}", self.config.summary());

        let work_dir =
            WorkDir::prepare(&self.config.persistence_base_dir).map_err(|source| {
                HarnessError::WorkDir {
                    path: self.config.persistence_base_dir.clone(),
                    source,
                }
            })?;

        let result = self.run_in_work_dir(sink);

        if let Err(e) = work_dir.remove() {
            warn!("unable to remove work directory: {}", e);
        }
        result
    }

    fn run_in_work_dir<K: SampleSink + 'static>(&self, sink: K) -> Result<RunReport, HarnessError> {
        let started = Instant::now();
        let config = &self.config;

        let mut handle = Some(start_cluster(&self.grid, config, config.cluster_size)?);
        let mut report = RunReport {
            config_summary: config.summary(),
            ..RunReport::default()
        };

        let monitor = Arc::new(ThroughputMonitor::new());
        let mut pool = WorkerPool::new(
            Arc::clone(&monitor),
            config.key_space_size,
            config.retry.clone(),
        );

        let outcome = match monitor.start(config.sample_interval(), sink) {
            Ok(sampler) => {
                let outcome = self.drive(&mut handle, &mut pool, &mut report);
                let workers = pool.shutdown();
                report.samples_emitted = sampler.stop();
                report.write_failures = workers.iter().map(|w: &WorkerReport| w.failures).sum();
                outcome
            }
            Err(e) => Err(HarnessError::Spawn(e)),
        };

        if let Some(handle) = handle.take() {
            if let Err(e) = stop_cluster(handle) {
                warn!("cluster shutdown during teardown failed: {}", e);
            }
        }

        report.total_operations = monitor.operations();
        report.elapsed = started.elapsed();
        outcome.map(|()| report)
    }

    fn drive(
        &self,
        handle: &mut Option<ClusterHandle<G::Node>>,
        pool: &mut WorkerPool,
        report: &mut RunReport,
    ) -> Result<(), HarnessError> {
        let config = &self.config;

        if let Some(current) = handle.as_ref() {
            if ensure_active(current)? {
                report.promotions += 1;
            }
        }

        for index in 0..config.client_count {
            let client = self
                .grid
                .connect(config, index)
                .map_err(|source| HarnessError::Client { index, source })?;
            pool.spawn_client(client, config.workers_per_client)
                .map_err(HarnessError::Spawn)?;
        }
        report.workers_spawned = pool.spawned();
        info!("{} workers running", report.workers_spawned);

        for iteration in 0..config.iteration_count {
            info!("Starting an iteration no. {}", iteration);
            thread::sleep(config.iteration_duration());

            info!("About to terminate the cluster");
            if let Some(old) = handle.take() {
                stop_cluster(old)?;
            }
            info!("The cluster is terminated. Starting a new one.");

            let fresh = handle.insert(start_cluster(&self.grid, config, config.cluster_size)?);
            if ensure_active(fresh)? {
                report.promotions += 1;
            }
            info!("Cluster is running");

            report.restarts += 1;
            report.iterations_completed += 1;
            report.live_workers_after_restart.push(pool.live_workers());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hr_memory_grid::MemoryGrid;
    use crate::hr_sinks::RecordingSink;

    fn scenario_config(dir: &std::path::Path) -> HarnessConfig {
        HarnessConfig {
            persistence_base_dir: dir.join("run"),
            cluster_size: 3,
            client_count: 2,
            workers_per_client: 2,
            iteration_count: 1,
            iteration_duration_seconds: 1,
            key_space_size: 1_000,
            connection_attempt_limit: 5,
            connection_attempt_period_ms: 10,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn test_single_restart_scenario() {
        let root = tempfile::tempdir().unwrap();
        let config = scenario_config(root.path());
        let grid = Arc::new(MemoryGrid::new().with_startup_delay(20, 30));
        let sink = RecordingSink::new();

        let driver = HarnessDriver::new(config.clone(), Arc::clone(&grid));
        let report = driver.run(sink.clone()).unwrap();

        assert_eq!(report.restarts, 1);
        assert_eq!(report.iterations_completed, 1);
        assert_eq!(report.workers_spawned, 4);
        assert_eq!(report.live_workers_after_restart, vec![4]);
        assert!(report.total_operations > 0);
        assert!(report.elapsed >= Duration::from_secs(1));
        // Entries written before the restart came back, so the new cluster
        // started PASSIVE and was promoted
        assert_eq!(report.promotions, 1);

        let samples = sink.samples();
        assert!(!samples.is_empty());
        assert_eq!(samples.len() as u64, report.samples_emitted);
        assert!(samples.iter().all(|s| s.throughput >= 0.0));

        // Teardown removed the cluster and the work directory
        assert!(!grid.is_running());
        assert!(!config.persistence_base_dir.exists());
    }

    #[test]
    fn test_no_promotion_without_persistence() {
        let root = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            persistence_enabled: false,
            iteration_count: 2,
            iteration_duration_seconds: 0,
            ..scenario_config(root.path())
        };
        let grid = Arc::new(MemoryGrid::new().with_startup_delay(0, 2));

        let report = HarnessDriver::new(config, grid)
            .run(RecordingSink::new())
            .unwrap();

        assert_eq!(report.restarts, 2);
        assert_eq!(report.promotions, 0);
    }

    #[test]
    fn test_restarts_do_not_leak_workers() {
        let root = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            iteration_count: 4,
            iteration_duration_seconds: 0,
            ..scenario_config(root.path())
        };
        let grid = Arc::new(MemoryGrid::new().with_startup_delay(0, 2));

        let report = HarnessDriver::new(config, grid)
            .run(RecordingSink::new())
            .unwrap();

        assert_eq!(report.restarts, 4);
        assert_eq!(report.live_workers_after_restart, vec![4, 4, 4, 4]);
    }

    #[test]
    fn test_bring_up_failure_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let config = scenario_config(root.path());
        let grid = Arc::new(MemoryGrid::new().with_startup_delay(0, 2).with_failed_starts(1));

        let result = HarnessDriver::new(config.clone(), Arc::clone(&grid)).run(RecordingSink::new());

        assert!(matches!(
            result,
            Err(HarnessError::Cluster(ClusterError::BringUp { .. }))
        ));
        assert!(!grid.is_running());
        assert!(!config.persistence_base_dir.exists());
    }

    #[test]
    fn test_work_dir_failure_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let config = HarnessConfig {
            persistence_base_dir: blocker.join("run"),
            ..scenario_config(root.path())
        };
        let grid = Arc::new(MemoryGrid::new());

        let result = HarnessDriver::new(config, Arc::clone(&grid)).run(RecordingSink::new());

        assert!(matches!(result, Err(HarnessError::WorkDir { .. })));
        assert!(!grid.is_running());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let config = HarnessConfig {
            cluster_size: 0,
            ..scenario_config(root.path())
        };
        let result = HarnessDriver::new(config, Arc::new(MemoryGrid::new())).run(RecordingSink::new());
        assert!(matches!(result, Err(HarnessError::Config(_))));
    }
}
