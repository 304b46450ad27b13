//! # hr_bench - Hot Restart Throughput Harness
//!
//! Drives a cache cluster through repeated full stop/start cycles while
//! client workers keep writing to it, and samples the write throughput once
//! per interval. The interesting behaviour (membership, persistence,
//! recovery) belongs to the cluster product; this crate only applies load,
//! restarts the cluster and measures.
//!
//! ## Core Components
//!
//! - **ThroughputMonitor**: atomic operation counter plus a cancellable sampler thread
//! - **WorkerPool**: worker threads writing `key -> key` over a bounded key space
//! - **Cluster controller**: parallel member start-up, ACTIVE promotion, shutdown
//! - **HarnessDriver**: the restart loop tying everything together
//! - **SampleSink**: where samples go (console, CSV, in-memory)
//!
//! ## Plugging in a cluster product
//!
//! The cluster and its client are reached through [`ClusterService`],
//! [`ClusterNode`], [`ClientConnector`] and [`CacheClient`]. The crate ships
//! [`MemoryGrid`], an in-process implementation with optional hot-restart
//! persistence, which the binaries and tests use.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hr_bench::{HarnessConfig, HarnessDriver, MemoryGrid, RecordingSink};
//!
//! let config = HarnessConfig {
//!     iteration_count: 2,
//!     iteration_duration_seconds: 5,
//!     ..HarnessConfig::default()
//! };
//! let sink = RecordingSink::new();
//! let driver = HarnessDriver::new(config, Arc::new(MemoryGrid::new()));
//! let report = driver.run(sink.clone()).unwrap();
//! report.print_summary();
//! ```

pub mod hr_config;
pub mod hr_interface;
pub mod hr_monitor;
pub mod hr_workers;
pub mod hr_cluster;
pub mod hr_driver;
pub mod hr_workdir;

// Sinks and the in-process cluster
pub mod hr_memory_grid;
pub mod hr_sinks;

// Re-export commonly used types
pub use hr_config::{ConfigError, HarnessConfig, RetryPolicy};
pub use hr_driver::{HarnessDriver, HarnessError, RunReport};
pub use hr_interface::{
    CacheClient, CacheError, ClientConnector, ClusterError, ClusterNode, ClusterService,
    ClusterState, NoOpSink, Sample, SampleSink, SinkError,
};
pub use hr_memory_grid::MemoryGrid;
pub use hr_monitor::{SamplerHandle, ThroughputMonitor};
pub use hr_sinks::{sink_for, ConsoleSampleSink, CsvSampleSink, FanoutSink, RecordingSink};
pub use hr_workers::WorkerPool;
