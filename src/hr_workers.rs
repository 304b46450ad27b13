//! Worker pool
//!
//! Every worker owns a cursor into the key space and writes `key -> key`
//! through its client context as fast as the client allows. A failed write
//! is logged and the same key is tried again; the cursor only moves after a
//! success (or when a bounded [`RetryPolicy`] gives up on the key).
//!
//! Workers keep running across cluster restarts. The pool only stops them
//! on [`WorkerPool::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::hr_config::RetryPolicy;
use crate::hr_interface::{CacheClient, CacheKey};
use crate::hr_monitor::ThroughputMonitor;

// ============================================================================
// Cursor
// ============================================================================

/// Position of one worker in the key space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCursor {
    key: CacheKey,
    key_space: u64,
}

impl WorkerCursor {
    pub fn new(key_space: u64) -> Self {
        Self {
            key: 0,
            key_space: key_space.max(1),
        }
    }

    pub fn key(&self) -> CacheKey {
        self.key
    }

    pub fn advance(&mut self) {
        self.key = (self.key + 1) % self.key_space;
    }
}

/// What a worker did before it was stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub client: usize,
    pub worker: usize,
    pub successes: u64,
    pub failures: u64,
    pub abandoned_keys: u64,
    pub next_key: CacheKey,
}

// ============================================================================
// Worker loop
// ============================================================================

struct Worker<C: CacheClient> {
    client_index: usize,
    index: usize,
    client: Arc<C>,
    monitor: Arc<ThroughputMonitor>,
    stop: Arc<AtomicBool>,
    retry: RetryPolicy,
    cursor: WorkerCursor,
}

impl<C: CacheClient> Worker<C> {
    fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport {
            client: self.client_index,
            worker: self.index,
            ..WorkerReport::default()
        };
        let mut attempts = 0u32;

        while !self.stop.load(Ordering::Relaxed) {
            let key = self.cursor.key();
            match self.client.put(key, key) {
                Ok(()) => {
                    self.monitor.record_operation();
                    report.successes += 1;
                    attempts = 0;
                    self.cursor.advance();
                }
                Err(e) => {
                    report.failures += 1;
                    attempts = attempts.saturating_add(1);
                    warn!(
                        "client {} worker {}: put({}) failed: {}",
                        self.client_index, self.index, key, e
                    );

                    if self.retry.exhausted(attempts) {
                        warn!(
                            "client {} worker {}: giving up on key {} after {} attempts",
                            self.client_index, self.index, key, attempts
                        );
                        report.abandoned_keys += 1;
                        attempts = 0;
                        self.cursor.advance();
                    }
                    if let Some(pause) = self.retry.backoff() {
                        thread::sleep(pause);
                    }
                }
            }
        }

        report.next_key = self.cursor.key();
        debug!(
            "client {} worker {} stopped: {} ok, {} failed",
            self.client_index, self.index, report.successes, report.failures
        );
        report
    }
}

// ============================================================================
// Pool
// ============================================================================

/// All worker threads of a run
pub struct WorkerPool {
    monitor: Arc<ThroughputMonitor>,
    retry: RetryPolicy,
    key_space: u64,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<WorkerReport>>,
    clients: usize,
}

impl WorkerPool {
    pub fn new(monitor: Arc<ThroughputMonitor>, key_space: u64, retry: RetryPolicy) -> Self {
        Self {
            monitor,
            retry,
            key_space,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            clients: 0,
        }
    }

    /// Start `workers` threads sharing one client context
    ///
    /// Returns the index assigned to the client context.
    pub fn spawn_client<C: CacheClient>(
        &mut self,
        client: C,
        workers: usize,
    ) -> std::io::Result<usize> {
        let client_index = self.clients;
        self.clients += 1;
        let client = Arc::new(client);

        for index in 0..workers {
            let worker = Worker {
                client_index,
                index,
                client: Arc::clone(&client),
                monitor: Arc::clone(&self.monitor),
                stop: Arc::clone(&self.stop),
                retry: self.retry.clone(),
                cursor: WorkerCursor::new(self.key_space),
            };
            let handle = thread::Builder::new()
                .name(format!("client-{}-worker-{}", client_index, index))
                .spawn(move || worker.run())?;
            self.workers.push(handle);
        }
        Ok(client_index)
    }

    /// Worker threads spawned so far
    pub fn spawned(&self) -> usize {
        self.workers.len()
    }

    /// Worker threads that have not exited
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Stop every worker and collect their reports
    pub fn shutdown(self) -> Vec<WorkerReport> {
        self.stop.store(true, Ordering::Relaxed);
        self.workers
            .into_iter()
            .filter_map(|w| match w.join() {
                Ok(report) => Some(report),
                Err(_) => {
                    warn!("worker thread panicked");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hr_interface::{CacheError, CacheValue, ClusterState};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    /// Records every attempted key; fails the first `fail_first` calls
    #[derive(Default)]
    struct ScriptedClient {
        attempts: Mutex<Vec<CacheKey>>,
        fail_first: u64,
        calls: AtomicU64,
        limit: Option<u64>,
    }

    impl CacheClient for ScriptedClient {
        fn put(&self, key: CacheKey, value: CacheValue) -> Result<(), CacheError> {
            assert_eq!(key, value);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.limit {
                if n >= limit {
                    thread::sleep(Duration::from_millis(1));
                    return Err(CacheError::Disconnected);
                }
            }
            self.attempts.lock().push(key);
            if n < self.fail_first {
                Err(CacheError::ClusterNotActive(ClusterState::Passive))
            } else {
                Ok(())
            }
        }
    }

    impl CacheClient for Arc<ScriptedClient> {
        fn put(&self, key: CacheKey, value: CacheValue) -> Result<(), CacheError> {
            (**self).put(key, value)
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_cursor_wraps() {
        let mut cursor = WorkerCursor::new(5);
        for expected in 0..5 {
            assert_eq!(cursor.key(), expected);
            cursor.advance();
        }
        assert_eq!(cursor.key(), 0);
    }

    #[test]
    fn test_worker_wraps_after_key_space() {
        let monitor = Arc::new(ThroughputMonitor::new());
        let client = Arc::new(ScriptedClient {
            limit: Some(6),
            ..ScriptedClient::default()
        });

        let mut pool = WorkerPool::new(Arc::clone(&monitor), 5, RetryPolicy::default());
        pool.spawn_client(Arc::clone(&client), 1).unwrap();
        wait_for(|| client.calls.load(Ordering::SeqCst) > 6);
        let reports = pool.shutdown();

        assert_eq!(*client.attempts.lock(), vec![0, 1, 2, 3, 4, 0]);
        assert_eq!(monitor.operations(), 6);
        assert_eq!(reports[0].successes, 6);
        assert_eq!(reports[0].next_key, 1);
    }

    #[test]
    fn test_failed_write_retries_same_key() {
        let monitor = Arc::new(ThroughputMonitor::new());
        let client = Arc::new(ScriptedClient {
            fail_first: 3,
            limit: Some(5),
            ..ScriptedClient::default()
        });

        let mut pool = WorkerPool::new(Arc::clone(&monitor), 100, RetryPolicy::default());
        pool.spawn_client(Arc::clone(&client), 1).unwrap();
        wait_for(|| client.calls.load(Ordering::SeqCst) > 5);
        let reports = pool.shutdown();

        assert_eq!(*client.attempts.lock(), vec![0, 0, 0, 0, 1]);
        // Failures are never counted as operations
        assert_eq!(monitor.operations(), 2);
        assert!(reports[0].failures >= 3);
        assert_eq!(reports[0].abandoned_keys, 0);
    }

    #[test]
    fn test_bounded_retry_abandons_key() {
        let monitor = Arc::new(ThroughputMonitor::new());
        let client = Arc::new(ScriptedClient {
            fail_first: 2,
            limit: Some(3),
            ..ScriptedClient::default()
        });
        let retry = RetryPolicy {
            max_attempts: Some(2),
            backoff_ms: 0,
        };

        let mut pool = WorkerPool::new(Arc::clone(&monitor), 100, retry);
        pool.spawn_client(Arc::clone(&client), 1).unwrap();
        wait_for(|| client.calls.load(Ordering::SeqCst) > 3);
        let reports = pool.shutdown();

        assert_eq!(*client.attempts.lock(), vec![0, 0, 1]);
        // Later keys may also be abandoned once the client stays down
        assert!(reports[0].abandoned_keys >= 1);
        assert_eq!(monitor.operations(), 1);
    }

    #[test]
    fn test_concurrent_workers_count_exactly() {
        let monitor = Arc::new(ThroughputMonitor::new());
        let mut pool = WorkerPool::new(Arc::clone(&monitor), 1_000, RetryPolicy::default());

        let clients: Vec<Arc<ScriptedClient>> = (0..3)
            .map(|_| {
                Arc::new(ScriptedClient {
                    limit: Some(2_000),
                    ..ScriptedClient::default()
                })
            })
            .collect();
        for client in &clients {
            pool.spawn_client(Arc::clone(client), 4).unwrap();
        }
        assert_eq!(pool.spawned(), 12);
        assert_eq!(pool.live_workers(), 12);

        wait_for(|| clients.iter().all(|c| c.attempts.lock().len() == 2_000));
        let reports = pool.shutdown();

        assert_eq!(reports.len(), 12);
        assert_eq!(monitor.operations(), 3 * 2_000);
        let successes: u64 = reports.iter().map(|r| r.successes).sum();
        assert_eq!(successes, monitor.operations());
    }
}
