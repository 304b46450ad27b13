//! Throughput monitor
//!
//! Workers call [`ThroughputMonitor::record_operation`] after every
//! successful write. A background sampler turns the counter into one
//! operations-per-second [`Sample`] per interval and hands it to a
//! [`SampleSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::hr_interface::{Sample, SampleSink};

/// Shared operation counter
#[derive(Debug, Default)]
pub struct ThroughputMonitor {
    ops: AtomicU64,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self {
            ops: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_operation(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operations(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    /// Start sampling on a background thread
    ///
    /// The sampler keeps running until the returned handle is stopped or
    /// dropped. Sink failures are logged and never stop the sampler.
    pub fn start<S: SampleSink + 'static>(
        self: &Arc<Self>,
        interval: Duration,
        mut sink: S,
    ) -> std::io::Result<SamplerHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let monitor = Arc::clone(self);
        let baseline = self.operations();

        let join = thread::Builder::new()
            .name("throughput-sampler".into())
            .spawn(move || {
                let mut sampler = ThroughputSampler::new(interval, baseline);
                let mut emitted = 0u64;
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    let sample = sampler.tick(monitor.operations(), SystemTime::now());
                    emitted += 1;
                    if let Err(e) = sink.accept(sample) {
                        warn!("sample sink failed, continuing: {}", e);
                    }
                }
                debug!("sampler stopped after {} samples", emitted);
                emitted
            })?;

        Ok(SamplerHandle {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }
}

// ============================================================================
// Delta computation
// ============================================================================

/// Turns successive counter readings into per-second throughput
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    interval_secs: f64,
    last: u64,
}

impl ThroughputSampler {
    pub fn new(interval: Duration, baseline: u64) -> Self {
        Self {
            interval_secs: interval.as_secs_f64(),
            last: baseline,
        }
    }

    /// Compute the sample for one elapsed interval and move the baseline
    pub fn tick(&mut self, now: u64, at: SystemTime) -> Sample {
        let delta = now.wrapping_sub(self.last);
        self.last = now;

        let throughput = if self.interval_secs > 0.0 {
            delta as f64 / self.interval_secs
        } else {
            0.0
        };

        Sample {
            timestamp: at,
            throughput,
        }
    }
}

// ============================================================================
// Sampler lifetime
// ============================================================================

/// Owner of a running sampler thread
pub struct SamplerHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<u64>>,
}

impl SamplerHandle {
    /// Stop the sampler and wait for it; returns the number of samples emitted
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    fn shutdown(&mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            // Full channel or gone receiver both mean the sampler is stopping
            let _ = stop.try_send(());
        }
        match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|_| {
                warn!("sampler thread panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
