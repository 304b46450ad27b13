// Cluster lifecycle controller
//
// Brings a cluster up with one thread per member, promotes it to the active
// state and shuts it down as a unit. A handle is never reused: a restart
// consumes the old handle and produces a fresh one.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use log::{info, warn};

use crate::hr_config::HarnessConfig;
use crate::hr_interface::{ClusterError, ClusterNode, ClusterService, ClusterState};

/// Members of one started cluster, ordered by slot
pub struct ClusterHandle<N: ClusterNode> {
    nodes: Vec<N>,
}

impl<N: ClusterNode> ClusterHandle<N> {
    /// The member that speaks for the whole cluster
    pub fn first(&self) -> &N {
        // A handle is only built from a non-empty, fully started member list
        &self.nodes[0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[N] {
        &self.nodes
    }
}

/// Start `size` members concurrently and wait for every one of them
///
/// Returns only after all `size` start-up threads have reported. Any failed
/// member fails the whole bring-up; members that did start are shut down
/// again before the error is returned.
pub fn start_cluster<S: ClusterService>(
    service: &Arc<S>,
    config: &HarnessConfig,
    size: usize,
) -> Result<ClusterHandle<S::Node>, ClusterError> {
    if size == 0 {
        return Err(ClusterError::EmptyCluster);
    }

    let (done_tx, done_rx) = bounded(size);
    let mut spawn_error = None;

    for slot in 0..size {
        let service = Arc::clone(service);
        let config = config.clone();
        let done_tx = done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("node-start-{}", slot))
            .spawn(move || {
                let result = service.create_node(&config, slot);
                let _ = done_tx.send((slot, result));
            });
        if let Err(e) = spawned {
            spawn_error.get_or_insert(ClusterError::BringUp {
                node: slot,
                reason: format!("unable to spawn start-up thread: {}", e),
            });
            break;
        }
    }
    drop(done_tx);

    // Wait-for-all: one report per spawned start-up thread
    let mut slots: Vec<Option<S::Node>> = (0..size).map(|_| None).collect();
    let mut failure = spawn_error;
    for (slot, result) in done_rx.iter() {
        match result {
            Ok(node) => slots[slot] = Some(node),
            Err(e) => {
                warn!("node {} failed to start: {}", slot, e);
                failure.get_or_insert(match e {
                    ClusterError::BringUp { .. } => e,
                    other => ClusterError::BringUp {
                        node: slot,
                        reason: other.to_string(),
                    },
                });
            }
        }
    }

    // A start-up thread that panicked never reports its slot
    if failure.is_none() {
        if let Some(slot) = slots.iter().position(Option::is_none) {
            warn!("node {} start-up thread exited without reporting", slot);
            failure = Some(ClusterError::BringUp {
                node: slot,
                reason: "start-up thread exited without reporting".into(),
            });
        }
    }

    if let Some(err) = failure {
        if let Some(node) = slots.iter().flatten().next() {
            if let Err(e) = node.shutdown_cluster() {
                warn!("unable to shut down partially started cluster: {}", e);
            }
        }
        return Err(err);
    }

    let nodes: Vec<S::Node> = slots.into_iter().flatten().collect();
    info!("{} cluster members started", nodes.len());
    Ok(ClusterHandle { nodes })
}

/// Move the cluster to ACTIVE unless it already is
///
/// A cluster recovering from persisted data may come up in a non-serving
/// state. The check runs after every start, whether or not persistence is on.
/// Returns `true` when the cluster had to be promoted.
pub fn ensure_active<N: ClusterNode>(handle: &ClusterHandle<N>) -> Result<bool, ClusterError> {
    let node = handle.first();
    let state = node.cluster_state();
    if state == ClusterState::Active {
        info!("Cluster is already in ACTIVE mode");
        return Ok(false);
    }

    info!("Cluster state is {}, moving to ACTIVE", state);
    node.change_cluster_state(ClusterState::Active)?;
    info!("Done. Cluster is now in ACTIVE mode");
    Ok(true)
}

/// Shut down the cluster through its first member
///
/// Returns once the local shutdown call completes; propagation to the other
/// members is the cluster's own business.
pub fn stop_cluster<N: ClusterNode>(handle: ClusterHandle<N>) -> Result<(), ClusterError> {
    handle.first().shutdown_cluster()
}

/// Stop the cluster, start a fresh one with the same configuration and
/// bring it to ACTIVE
pub fn restart_cluster<S: ClusterService>(
    service: &Arc<S>,
    config: &HarnessConfig,
    handle: ClusterHandle<S::Node>,
) -> Result<ClusterHandle<S::Node>, ClusterError> {
    let size = handle.len();
    stop_cluster(handle)?;
    let handle = start_cluster(service, config, size)?;
    ensure_active(&handle)?;
    Ok(handle)
}
