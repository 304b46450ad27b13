// Shared types and collaborator traits for the restart harness.
//
// The cluster product, its cache client and the sample sink are reached only
// through the traits below. `hr_memory_grid` provides the in-process
// implementation used by the binaries and tests.

use std::path::PathBuf;
use std::time::SystemTime;

use thiserror::Error;

use crate::hr_config::HarnessConfig;

pub type NodeId = u64;
pub type CacheKey = u64;
pub type CacheValue = u64;

// ============================================================================
// Cluster state
// ============================================================================

/// Operational mode of a cluster, as reported by any of its members
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ClusterState {
    /// Serving live traffic
    Active,
    /// Members are fixed, no new data accepted
    Frozen,
    /// Recovered or draining, read-only
    Passive,
    /// A state change is being applied
    InTransition,
    /// A cluster-wide shutdown was requested
    ShuttingDown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClusterState::Active => "ACTIVE",
            ClusterState::Frozen => "FROZEN",
            ClusterState::Passive => "PASSIVE",
            ClusterState::InTransition => "IN_TRANSITION",
            ClusterState::ShuttingDown => "SHUTTING_DOWN",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Samples
// ============================================================================

/// One throughput measurement: operations per second over a single interval
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub throughput: f64,
}

impl Sample {
    /// Milliseconds since the unix epoch, 0 for clocks set before it
    pub fn timestamp_millis(&self) -> u128 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A write against the cache failed
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("client is not connected to any cluster")]
    Disconnected,

    #[error("cluster is in {0} state and does not accept writes")]
    ClusterNotActive(ClusterState),

    #[error("unable to connect after {attempts} attempts")]
    ConnectFailed { attempts: u32 },
}

/// Cluster bring-up, state change or shutdown failed
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster bring-up failed: node {node} did not start: {reason}")]
    BringUp { node: usize, reason: String },

    #[error("cluster size must be at least 1")]
    EmptyCluster,

    #[error("unable to change cluster state from {from} to {to}")]
    StateChange { from: ClusterState, to: ClusterState },

    #[error("cluster shutdown failed: {0}")]
    Shutdown(String),

    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The sample sink could not take a sample
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sample rejected: {0}")]
    Rejected(String),
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Client side of the cache: the only operation the workers use
pub trait CacheClient: Send + Sync + 'static {
    fn put(&self, key: CacheKey, value: CacheValue) -> Result<(), CacheError>;
}

/// Creates client contexts, one per simulated client process
pub trait ClientConnector {
    type Client: CacheClient;

    fn connect(&self, config: &HarnessConfig, index: usize) -> Result<Self::Client, CacheError>;
}

/// A started cluster member
pub trait ClusterNode: Send + 'static {
    fn node_id(&self) -> NodeId;

    fn cluster_state(&self) -> ClusterState;

    /// Request a cluster-wide state change and wait until it is applied
    fn change_cluster_state(&self, state: ClusterState) -> Result<(), ClusterError>;

    /// Shut down the whole cluster this node belongs to
    fn shutdown_cluster(&self) -> Result<(), ClusterError>;
}

/// Server side of the cache product
///
/// `create_node` returning is the node's readiness signal: it must only
/// return once the member has started and joined its cluster.
pub trait ClusterService: Send + Sync + 'static {
    type Node: ClusterNode;

    fn create_node(&self, config: &HarnessConfig, slot: usize) -> Result<Self::Node, ClusterError>;
}

/// Consumer of throughput samples
pub trait SampleSink: Send {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError>;
}

impl SampleSink for Box<dyn SampleSink> {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError> {
        (**self).accept(sample)
    }
}

/// Sink that discards every sample
pub struct NoOpSink;

impl SampleSink for NoOpSink {
    #[inline(always)]
    fn accept(&mut self, _sample: Sample) -> Result<(), SinkError> {
        Ok(())
    }
}
