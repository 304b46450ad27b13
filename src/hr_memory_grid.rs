// In-process cluster and cache client
//
// A small stand-in for the cluster product so the harness can run without
// external processes. Members started close together join the same cluster;
// once that cluster is shut down the next member starts a new one. Clients
// always talk to whichever cluster is current, so a restart shows up for
// them as a window of failed writes, never as a handle change.
//
// With persistence enabled every cluster flushes its entries to
// `<persistence_base_dir>/<cache_name>.hot` on shutdown and reloads them
// when the next cluster forms. A cluster that recovered data comes up in the
// configured recovered state (PASSIVE by default) and has to be promoted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::hr_config::HarnessConfig;
use crate::hr_interface::{
    CacheClient, CacheError, CacheKey, CacheValue, ClientConnector, ClusterError, ClusterNode,
    ClusterService, ClusterState, NodeId,
};

const DISCONNECTED: u64 = u64::MAX;

// ============================================================================
// Grid
// ============================================================================

/// Entry point for nodes and clients; clones share the same grid
#[derive(Clone)]
pub struct MemoryGrid {
    inner: Arc<GridInner>,
    startup_delay_ms: (u64, u64),
    recovered_state: ClusterState,
}

struct GridInner {
    current: RwLock<Option<Arc<GridCluster>>>,
    next_node_id: AtomicU64,
    next_generation: AtomicU64,
    failed_starts: AtomicUsize,
}

struct GridCluster {
    generation: u64,
    state: RwLock<ClusterState>,
    entries: Mutex<HashMap<CacheKey, CacheValue>>,
    members: Mutex<Vec<NodeId>>,
    store: Option<HotRestartStore>,
}

impl MemoryGrid {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GridInner {
                current: RwLock::new(None),
                next_node_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                failed_starts: AtomicUsize::new(0),
            }),
            startup_delay_ms: (5, 25),
            recovered_state: ClusterState::Passive,
        }
    }

    /// Random member start-up time, inclusive range in milliseconds
    pub fn with_startup_delay(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.startup_delay_ms = (min_ms, max_ms.max(min_ms));
        self
    }

    /// State a cluster comes up in after recovering persisted entries
    pub fn with_recovered_state(mut self, state: ClusterState) -> Self {
        self.recovered_state = state;
        self
    }

    /// Make the next `count` member start-ups fail
    pub fn with_failed_starts(self, count: usize) -> Self {
        self.inner.failed_starts.store(count, Ordering::SeqCst);
        self
    }

    fn startup_delay(&self) -> Option<Duration> {
        let (min, max) = self.startup_delay_ms;
        if max == 0 {
            return None;
        }
        let ms = rand::thread_rng().gen_range(min..=max);
        Some(Duration::from_millis(ms))
    }

    /// Generation of the running cluster, if any
    pub fn generation(&self) -> Option<u64> {
        self.inner.current().map(|c| c.generation)
    }

    pub fn is_running(&self) -> bool {
        self.inner.current().is_some()
    }

    /// Members of the running cluster
    pub fn member_count(&self) -> usize {
        self.inner.current().map_or(0, |c| c.members.lock().len())
    }

    pub fn entry_count(&self) -> usize {
        self.inner.current().map_or(0, |c| c.entries.lock().len())
    }

    /// Read an entry from the running cluster
    pub fn get(&self, key: CacheKey) -> Option<CacheValue> {
        self.inner
            .current()
            .and_then(|c| c.entries.lock().get(&key).copied())
    }
}

impl Default for MemoryGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl GridInner {
    fn current(&self) -> Option<Arc<GridCluster>> {
        self.current.read().clone()
    }

    /// Join the running cluster or form a new one
    fn join(
        &self,
        config: &HarnessConfig,
        id: NodeId,
        recovered_state: ClusterState,
    ) -> Result<Arc<GridCluster>, ClusterError> {
        let mut current = self.current.write();
        if let Some(cluster) = current.as_ref() {
            cluster.members.lock().push(id);
            return Ok(Arc::clone(cluster));
        }

        let store = config
            .persistence_enabled
            .then(|| HotRestartStore::new(&config.persistence_base_dir, &config.cache_name));
        let entries = match &store {
            Some(store) => store.load()?,
            None => HashMap::new(),
        };
        let state = if entries.is_empty() {
            ClusterState::Active
        } else {
            recovered_state
        };

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        info!(
            "cluster generation {} formed by node {}: {} entries recovered, state {}",
            generation,
            id,
            entries.len(),
            state
        );

        let cluster = Arc::new(GridCluster {
            generation,
            state: RwLock::new(state),
            entries: Mutex::new(entries),
            members: Mutex::new(vec![id]),
            store,
        });
        *current = Some(Arc::clone(&cluster));
        Ok(cluster)
    }

    fn take_failed_start(&self) -> bool {
        self.failed_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// One member of a grid cluster
pub struct MemoryNode {
    id: NodeId,
    cluster: Arc<GridCluster>,
    grid: Arc<GridInner>,
}

impl MemoryNode {
    pub fn generation(&self) -> u64 {
        self.cluster.generation
    }
}

impl ClusterService for MemoryGrid {
    type Node = MemoryNode;

    fn create_node(&self, config: &HarnessConfig, slot: usize) -> Result<MemoryNode, ClusterError> {
        if let Some(delay) = self.startup_delay() {
            thread::sleep(delay);
        }
        if self.inner.take_failed_start() {
            return Err(ClusterError::BringUp {
                node: slot,
                reason: "member failed to join".into(),
            });
        }

        let id = self.inner.next_node_id.fetch_add(1, Ordering::SeqCst);
        let cluster = self.inner.join(config, id, self.recovered_state)?;
        debug!("node {} (slot {}) joined generation {}", id, slot, cluster.generation);

        Ok(MemoryNode {
            id,
            cluster,
            grid: Arc::clone(&self.inner),
        })
    }
}

impl ClusterNode for MemoryNode {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn cluster_state(&self) -> ClusterState {
        *self.cluster.state.read()
    }

    fn change_cluster_state(&self, state: ClusterState) -> Result<(), ClusterError> {
        let mut current = self.cluster.state.write();
        if *current == ClusterState::ShuttingDown {
            return Err(ClusterError::StateChange {
                from: *current,
                to: state,
            });
        }
        *current = state;
        Ok(())
    }

    fn shutdown_cluster(&self) -> Result<(), ClusterError> {
        {
            let mut current = self.grid.current.write();
            if current
                .as_ref()
                .is_some_and(|c| Arc::ptr_eq(c, &self.cluster))
            {
                *current = None;
            }
        }

        // Holding the entries lock while switching state orders this after
        // every write that already passed the state check
        let entries = self.cluster.entries.lock();
        {
            let mut state = self.cluster.state.write();
            if *state == ClusterState::ShuttingDown {
                return Ok(());
            }
            *state = ClusterState::ShuttingDown;
        }

        if let Some(store) = &self.cluster.store {
            store.save(&entries)?;
        }
        info!(
            "cluster generation {} shut down by node {} ({} entries)",
            self.cluster.generation,
            self.id,
            entries.len()
        );
        Ok(())
    }
}

// ============================================================================
// Clients
// ============================================================================

/// Client context; follows the grid from cluster to cluster
pub struct MemoryClient {
    index: usize,
    grid: Arc<GridInner>,
    observed_generation: AtomicU64,
}

impl ClientConnector for MemoryGrid {
    type Client = MemoryClient;

    fn connect(&self, config: &HarnessConfig, index: usize) -> Result<MemoryClient, CacheError> {
        let limit = config.connection_attempt_limit.max(1);
        for attempt in 1..=limit {
            if let Some(cluster) = self.inner.current() {
                info!(
                    "client {} connected to cluster generation {} (attempt {})",
                    index, cluster.generation, attempt
                );
                return Ok(MemoryClient {
                    index,
                    grid: Arc::clone(&self.inner),
                    observed_generation: AtomicU64::new(cluster.generation),
                });
            }
            if attempt < limit {
                thread::sleep(config.connection_attempt_period());
            }
        }
        Err(CacheError::ConnectFailed { attempts: limit })
    }
}

impl MemoryClient {
    fn observe(&self, generation: u64) {
        let previous = self.observed_generation.swap(generation, Ordering::Relaxed);
        if previous == generation {
            return;
        }
        if generation == DISCONNECTED {
            info!("Client {} state changed. Current state: DISCONNECTED", self.index);
        } else {
            info!(
                "Client {} state changed. Current state: CONNECTED to generation {}",
                self.index, generation
            );
        }
    }
}

impl CacheClient for MemoryClient {
    fn put(&self, key: CacheKey, value: CacheValue) -> Result<(), CacheError> {
        let cluster = match self.grid.current() {
            Some(cluster) => cluster,
            None => {
                self.observe(DISCONNECTED);
                return Err(CacheError::Disconnected);
            }
        };
        self.observe(cluster.generation);

        let mut entries = cluster.entries.lock();
        let state = *cluster.state.read();
        if state != ClusterState::Active {
            return Err(CacheError::ClusterNotActive(state));
        }
        entries.insert(key, value);
        Ok(())
    }
}

// ============================================================================
// Hot-restart store
// ============================================================================

/// Flat `key value` file holding one cache's entries across restarts
struct HotRestartStore {
    path: PathBuf,
}

impl HotRestartStore {
    fn new(base_dir: &Path, cache_name: &str) -> Self {
        Self {
            path: base_dir.join(format!("{}.hot", cache_name)),
        }
    }

    fn persistence_error(&self, source: std::io::Error) -> ClusterError {
        ClusterError::Persistence {
            path: self.path.clone(),
            source,
        }
    }

    fn load(&self) -> Result<HashMap<CacheKey, CacheValue>, ClusterError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(self.persistence_error(e)),
        };

        let mut entries = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| self.persistence_error(e))?;
            let mut parts = line.split_whitespace();
            let parsed = match (parts.next(), parts.next()) {
                (Some(k), Some(v)) => k.parse::<CacheKey>().ok().zip(v.parse::<CacheValue>().ok()),
                _ => None,
            };
            match parsed {
                Some((key, value)) => {
                    entries.insert(key, value);
                }
                None => {
                    return Err(self.persistence_error(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed entry: {:?}", line),
                    )))
                }
            }
        }
        Ok(entries)
    }

    fn save(&self, entries: &HashMap<CacheKey, CacheValue>) -> Result<(), ClusterError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.persistence_error(e))?;
        }
        let tmp = self.path.with_extension("hot.tmp");
        let write = || -> std::io::Result<()> {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for (key, value) in entries {
                writeln!(writer, "{} {}", key, value)?;
            }
            writer.flush()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| self.persistence_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hr_cluster::{ensure_active, start_cluster, stop_cluster};

    fn config_in(dir: &Path, persistence: bool) -> HarnessConfig {
        HarnessConfig {
            persistence_enabled: persistence,
            persistence_base_dir: dir.to_path_buf(),
            connection_attempt_limit: 3,
            connection_attempt_period_ms: 1,
            ..HarnessConfig::default()
        }
    }

    fn fast_grid() -> MemoryGrid {
        MemoryGrid::new().with_startup_delay(0, 2)
    }

    #[test]
    fn test_members_join_one_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Arc::new(fast_grid());
        let handle = start_cluster(&grid, &config_in(dir.path(), false), 3).unwrap();

        assert_eq!(grid.member_count(), 3);
        let generation = handle.first().generation();
        assert!(handle.nodes().iter().all(|n| n.generation() == generation));
        assert_eq!(handle.first().cluster_state(), ClusterState::Active);
    }

    #[test]
    fn test_writes_fail_while_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), false);
        let grid = Arc::new(fast_grid());
        let handle = start_cluster(&grid, &config, 2).unwrap();
        let client = grid.connect(&config, 0).unwrap();

        client.put(1, 1).unwrap();
        stop_cluster(handle).unwrap();
        assert!(!grid.is_running());
        assert_eq!(client.put(2, 2), Err(CacheError::Disconnected));

        // The same client reaches the next cluster without reconnecting
        let handle = start_cluster(&grid, &config, 2).unwrap();
        ensure_active(&handle).unwrap();
        client.put(3, 3).unwrap();
        assert_eq!(grid.get(3), Some(3));
        // Nothing survives without persistence
        assert_eq!(grid.get(1), None);
    }

    #[test]
    fn test_hot_restart_recovers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), true);
        let grid = Arc::new(fast_grid());

        let handle = start_cluster(&grid, &config, 3).unwrap();
        let client = grid.connect(&config, 0).unwrap();
        for key in 0..100 {
            client.put(key, key).unwrap();
        }
        stop_cluster(handle).unwrap();
        assert!(dir.path().join("test-cache.hot").exists());

        let handle = start_cluster(&grid, &config, 3).unwrap();
        assert_eq!(handle.first().cluster_state(), ClusterState::Passive);
        assert_eq!(
            client.put(100, 100),
            Err(CacheError::ClusterNotActive(ClusterState::Passive))
        );

        ensure_active(&handle).unwrap();
        assert_eq!(grid.entry_count(), 100);
        assert_eq!(grid.get(42), Some(42));
        client.put(100, 100).unwrap();
    }

    #[test]
    fn test_recovered_state_configurable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), true);
        let grid = Arc::new(fast_grid().with_recovered_state(ClusterState::Active));

        let handle = start_cluster(&grid, &config, 1).unwrap();
        grid.connect(&config, 0).unwrap().put(7, 7).unwrap();
        stop_cluster(handle).unwrap();

        let handle = start_cluster(&grid, &config, 1).unwrap();
        assert_eq!(handle.first().cluster_state(), ClusterState::Active);
        assert_eq!(grid.get(7), Some(7));
    }

    #[test]
    fn test_connect_gives_up_without_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let grid = fast_grid();
        let result = grid.connect(&config_in(dir.path(), false), 0);
        assert!(matches!(result, Err(CacheError::ConnectFailed { attempts: 3 })));
    }

    #[test]
    fn test_injected_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Arc::new(fast_grid().with_failed_starts(1));
        let result = start_cluster(&grid, &config_in(dir.path(), false), 3);

        assert!(matches!(result, Err(ClusterError::BringUp { .. })));
        // Members that did start were shut down again
        assert!(!grid.is_running());
        assert!(start_cluster(&grid, &config_in(dir.path(), false), 3).is_ok());
    }

    #[test]
    fn test_malformed_store_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test-cache.hot"), "1 1\nnot-a-number\n").unwrap();
        let grid = Arc::new(fast_grid());

        let result = start_cluster(&grid, &config_in(dir.path(), true), 1);
        assert!(matches!(result, Err(ClusterError::BringUp { .. })));
    }
}
