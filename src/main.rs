// Restart bench: runs the hot-restart load test with the built-in defaults
//
// Usage:
//   cargo run --bin restart_bench
//   cargo run --bin restart_bench -- scenarios/quick.yaml
//   cargo run --bin restart_bench -- scenarios/quick.yaml --csv throughput.csv

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use hr_bench::{sink_for, HarnessConfig, HarnessDriver, MemoryGrid};

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .unwrap_or_else(|e| eprintln!("logger already initialised: {}", e));

    let args: Vec<String> = env::args().collect();

    let mut config = match args.get(1).filter(|a| !a.starts_with("--")) {
        Some(path) => HarnessConfig::from_yaml_file(path).unwrap_or_else(|e| {
            eprintln!("Failed to load {}: {}", path, e);
            process::exit(1);
        }),
        None => HarnessConfig::default(),
    };

    if let Some(pos) = args.iter().position(|a| a == "--csv") {
        match args.get(pos + 1) {
            Some(path) => config.csv_output_path = Some(PathBuf::from(path)),
            None => {
                eprintln!("Usage: {} [config.yaml] [--csv OUTPUT]", args[0]);
                process::exit(1);
            }
        }
    }

    let sink = sink_for(&config, true).unwrap_or_else(|e| {
        eprintln!("Failed to open sample output: {}", e);
        process::exit(1);
    });

    info!("starting");
    let driver = HarnessDriver::new(config, Arc::new(MemoryGrid::new()));
    match driver.run(sink) {
        Ok(report) => {
            report.print_summary();
            info!("done");
        }
        Err(e) => {
            error!("run failed: {}", e);
            process::exit(1);
        }
    }
}
