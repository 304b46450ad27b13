//! Sample sinks for different use cases

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::hr_config::HarnessConfig;
use crate::hr_interface::{Sample, SampleSink, SinkError};

// ============================================================================
// Console Sink
// ============================================================================

/// Prints every sample to the console
pub struct ConsoleSampleSink {
    enabled: bool,
    out: Box<dyn Write + Send>,
}

impl ConsoleSampleSink {
    pub fn new(enabled: bool) -> Self {
        Self::with_writer(enabled, Box::new(std::io::stdout()))
    }

    pub fn with_writer(enabled: bool, out: Box<dyn Write + Send>) -> Self {
        Self { enabled, out }
    }
}

impl SampleSink for ConsoleSampleSink {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError> {
        if !self.enabled {
            return Ok(());
        }
        writeln!(self.out, "Current value: {}", sample.throughput)?;
        self.out.flush()?;
        Ok(())
    }
}

// ============================================================================
// CSV Sink
// ============================================================================

/// Time series export, one row per sample, for external plotting
pub struct CsvSampleSink {
    writer: BufWriter<File>,
}

impl CsvSampleSink {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "timestamp_ms,throughput")?;

        Ok(Self { writer })
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl SampleSink for CsvSampleSink {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError> {
        writeln!(
            self.writer,
            "{},{:.3}",
            sample.timestamp_millis(),
            sample.throughput
        )?;
        // Rows must be visible while the run is still going
        self.writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Recording Sink
// ============================================================================

/// Keeps samples in memory; clones share the same list
#[derive(Clone, Default)]
pub struct RecordingSink {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for RecordingSink {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError> {
        self.samples.lock().push(sample);
        Ok(())
    }
}

// ============================================================================
// Fan-out Sink
// ============================================================================

/// Forwards every sample to several sinks
///
/// All sinks see every sample; the first error is reported after the
/// remaining sinks have been served.
pub struct FanoutSink {
    sinks: Vec<Box<dyn SampleSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn SampleSink>>) -> Self {
        Self { sinks }
    }
}

impl SampleSink for FanoutSink {
    fn accept(&mut self, sample: Sample) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.accept(sample) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Console output plus the CSV export named in the configuration
pub fn sink_for(config: &HarnessConfig, console: bool) -> std::io::Result<FanoutSink> {
    let mut sinks: Vec<Box<dyn SampleSink>> = vec![Box::new(ConsoleSampleSink::new(console))];
    if let Some(path) = &config.csv_output_path {
        sinks.push(Box::new(CsvSampleSink::new(path)?));
    }
    Ok(FanoutSink::new(sinks))
}
