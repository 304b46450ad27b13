// Scenario Runner - Load and execute restart scenario YAML files
//
// Usage:
//   cargo run --bin scenario_runner scenarios/quick_restart.yaml
//   cargo run --bin scenario_runner scenarios/  (runs all .yaml files in directory)
//   cargo run --bin scenario_runner scenarios/ --csv-dir out/

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use log::LevelFilter;
use simple_logger::SimpleLogger;

use hr_bench::{sink_for, HarnessConfig, HarnessDriver, MemoryGrid, RunReport};

/// Scenario file format
#[derive(Debug, serde::Deserialize)]
struct ScenarioFile {
    /// Scenario metadata
    #[serde(default)]
    meta: ScenarioMeta,

    /// Harness configuration, missing keys fall back to the defaults
    #[serde(default)]
    config: HarnessConfig,

    /// Member start-up time of the in-process grid
    #[serde(default)]
    grid: GridOverrides,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ScenarioMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct GridOverrides {
    startup_delay_min_ms: Option<u64>,
    startup_delay_max_ms: Option<u64>,
}

fn main() {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()
        .unwrap_or_else(|e| eprintln!("logger already initialised: {}", e));

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <scenario.yaml | directory/> [--csv-dir DIR]", args[0]);
        eprintln!("\nExamples:");
        eprintln!("  {} scenarios/quick_restart.yaml", args[0]);
        eprintln!("  {} scenarios/", args[0]);
        eprintln!("  {} scenarios/ --csv-dir out/", args[0]);
        process::exit(1);
    }

    let path = Path::new(&args[1]);

    let csv_dir: Option<PathBuf> = if args.len() >= 4 && args[2] == "--csv-dir" {
        Some(PathBuf::from(&args[3]))
    } else {
        None
    };

    let failed = if path.is_file() {
        !run_scenario_file(path, csv_dir.as_deref())
    } else if path.is_dir() {
        run_scenario_directory(path, csv_dir.as_deref()) > 0
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        process::exit(1);
    };

    if failed {
        process::exit(1);
    }
}

/// Runs every scenario in `dir`, returns the number of failed ones
fn run_scenario_directory(dir: &Path, csv_dir: Option<&Path>) -> usize {
    let mut scenarios = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("yaml")
                || path.extension().and_then(|s| s.to_str()) == Some("yml")
            {
                scenarios.push(path);
            }
        }
    }

    scenarios.sort();

    if scenarios.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  SCENARIO RUNNER - Multiple Scenarios                 ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} scenario(s) to run\n", scenarios.len());

    let mut failed = 0;
    for (i, scenario_path) in scenarios.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, scenarios.len(), scenario_path.display());
        if !run_scenario_file(scenario_path, csv_dir) {
            failed += 1;
        }
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All scenarios complete! ({} failed)                    ", failed);
    println!("╚════════════════════════════════════════════════════════╝\n");
    failed
}

fn run_scenario_file(path: &Path, csv_dir: Option<&Path>) -> bool {
    println!("Loading scenario from: {}", path.display());

    let yaml_content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read {}: {}", path.display(), e);
            return false;
        }
    };

    let scenario: ScenarioFile = match serde_yaml::from_str(&yaml_content) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Failed to parse {}: {}", path.display(), e);
            return false;
        }
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("scenario")
        .to_string();

    println!("\n╔════════════════════════════════════════════════════════╗");
    match scenario.meta.name {
        Some(ref name) => {
            println!("║  {}  {}", name, " ".repeat(54_usize.saturating_sub(name.len())))
        }
        None => println!("║  Scenario: {}  ", stem),
    }
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = scenario.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = scenario.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let mut config = scenario.config;
    if let Some(dir) = csv_dir {
        if let Err(e) = fs::create_dir_all(dir) {
            eprintln!("Failed to create {}: {}", dir.display(), e);
            return false;
        }
        config.csv_output_path = Some(dir.join(format!("{}.csv", stem)));
    }

    let mut grid = MemoryGrid::new();
    if let (Some(min), Some(max)) = (
        scenario.grid.startup_delay_min_ms,
        scenario.grid.startup_delay_max_ms,
    ) {
        grid = grid.with_startup_delay(min, max);
    }

    println!("Configuration:");
    println!("  Cluster Size: {}", config.cluster_size);
    println!("  Clients: {} x {} workers", config.client_count, config.workers_per_client);
    println!(
        "  Iterations: {} x {}s",
        config.iteration_count, config.iteration_duration_seconds
    );
    println!("  Key Space: {}", config.key_space_size);
    println!("  Persistence: {}", config.persistence_enabled);
    println!("\nStarting run...\n");

    let sink = match sink_for(&config, false) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("Failed to open sample output: {}", e);
            return false;
        }
    };

    let driver = HarnessDriver::new(config, Arc::new(grid));
    match driver.run(sink) {
        Ok(report) => {
            report.print_summary();
            check_report(&report, driver.config())
        }
        Err(e) => {
            eprintln!("\n✗ Scenario failed: {}\n", e);
            false
        }
    }
}

/// A run passes when every restart happened and no worker thread was lost
fn check_report(report: &RunReport, config: &HarnessConfig) -> bool {
    let expected_workers = config.total_workers();
    let restarts_ok = report.restarts == config.iteration_count;
    let workers_ok = report
        .live_workers_after_restart
        .iter()
        .all(|&live| live == expected_workers);

    if restarts_ok && workers_ok {
        println!("\n✓ Scenario complete!\n");
        true
    } else {
        println!(
            "\n✗ Scenario incomplete: {} of {} restarts, live workers {:?} (expected {})\n",
            report.restarts, config.iteration_count, report.live_workers_after_restart, expected_workers
        );
        false
    }
}
