//! # nrtrial
//!
//! CLI runner for the NR trial harvester.
//!
//! Runs the 5G simulator a number of times, derives link-quality metrics from
//! what it prints, and writes the resulting dataset. With no arguments it
//! uses the reference configuration and asks for the number of trials.

use nrtrial_model::{load_configs, RunConfig};
use nrtrial_runner::dataset_export;
use nrtrial_runner::{Orchestrator, RunSummary, RunnerError, SimulatorCommand, TrialProgress};

use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Timeout Parsing
// ============================================================================

/// Parse a trial timeout into seconds.
///
/// Accepts plain seconds (`90`, `0.5`) or a number with one unit suffix
/// (`90s`, `2m`, `1h`).
fn parse_timeout(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let (number, scale) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1.0),
        Some((i, 'm')) => (&s[..i], 60.0),
        Some((i, 'h')) => (&s[..i], 3600.0),
        _ => (s, 1.0),
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid timeout '{}'. Use seconds or a number with s, m or h.", s))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(format!("Timeout must be a positive duration, got '{}'", s));
    }

    Ok(value * scale)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// nrtrial - NR link-quality dataset harvester
#[derive(Parser, Debug)]
#[command(name = "nrtrial")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path(s) to YAML configuration file(s).
    /// Multiple files are merged in order (later overrides earlier).
    #[arg(short, long = "config", value_name = "FILE")]
    pub configs: Vec<PathBuf>,

    /// Number of trials (prompted for when neither this nor the config sets it)
    #[arg(short = 'n', long)]
    pub trials: Option<usize>,

    /// Seed for the user priority draw (default: random from system)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Kill a trial that runs longer than this (e.g., "90", "2m", "1h")
    #[arg(long, value_parser = parse_timeout)]
    pub timeout: Option<f64>,

    /// Working directory for the simulator
    #[arg(long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Human-readable per-trial log (appended to)
    #[arg(long, value_name = "FILE")]
    pub human_log: Option<PathBuf>,

    /// Numeric table of `CV UP SE` lines (overwritten)
    #[arg(long, value_name = "FILE")]
    pub numeric_table: Option<PathBuf>,

    /// Also export the full dataset as JSON
    #[arg(long, value_name = "FILE")]
    pub json: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Simulator command and arguments, replacing the configured ones (after `--`)
    #[arg(last = true, value_name = "COMMAND")]
    pub simulator: Vec<String>,
}

impl Cli {
    /// Load config files and apply command-line overrides.
    fn resolve_config(&self) -> Result<RunConfig, RunnerError> {
        let paths: Vec<&Path> = self.configs.iter().map(|p| p.as_path()).collect();
        let mut config = load_configs(&paths)?;

        if let Some((command, args)) = self.simulator.split_first() {
            config.simulator.command = command.clone();
            config.simulator.args = args.to_vec();
        }
        if self.timeout.is_some() {
            config.simulator.timeout_s = self.timeout;
        }
        if self.working_dir.is_some() {
            config.simulator.working_dir = self.working_dir.clone();
        }
        if let Some(path) = &self.human_log {
            config.output.human_log = path.clone();
        }
        if let Some(path) = &self.numeric_table {
            config.output.numeric_table = path.clone();
        }
        if self.json.is_some() {
            config.output.json = self.json.clone();
        }
        if self.trials.is_some() {
            config.run.trials = self.trials;
        }
        if self.seed.is_some() {
            config.run.seed = self.seed;
        }

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Trial Count Prompt
// ============================================================================

/// Parse a trial count typed by the user.
fn parse_trial_count(input: &str) -> Result<usize, RunnerError> {
    let trimmed = input.trim();
    let invalid = || RunnerError::InvalidTrialCount(trimmed.to_string());
    match trimmed.parse::<i64>() {
        Ok(n) if n >= 1 => usize::try_from(n).map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}

/// Ask for the number of trials on stdin.
fn prompt_trial_count() -> Result<usize, RunnerError> {
    let mut stderr = std::io::stderr();
    write!(stderr, "Enter the number of trials: ")?;
    stderr.flush()?;

    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    parse_trial_count(&input)
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn print_progress(progress: &TrialProgress<'_>) {
    let entry = progress.entry;
    let record = &entry.record;
    let position = record
        .position
        .map(|p| p.to_string())
        .unwrap_or_default();

    eprintln!("Trial {}/{} finished ({})", entry.index, progress.total, entry.outcome);
    eprintln!("  CV (check) = {:.6}", entry.normalized.channel_value);
    eprintln!("  SE (check) = {:.6}", entry.normalized.spectral_efficiency_norm);
    eprintln!(
        "  RSSI: {} dBm, SE: {} bps/Hz, UE Position: {}, User priority = {}",
        record.rssi_dbm, record.spectral_efficiency_bps_hz, position, record.user_priority
    );
}

/// Run all trials and persist the dataset.
pub fn run_trials(
    config: RunConfig,
    trials: usize,
    seed: u64,
    verbose: bool,
) -> Result<RunSummary, RunnerError> {
    let start = Instant::now();
    let launcher = SimulatorCommand::new(config.simulator.clone());

    if verbose {
        eprintln!("Simulator: {}", launcher.display_command());
        eprintln!("Using seed: {}", seed);
    }
    info!(trials, seed, command = %launcher.display_command(), "starting run");

    let mut orchestrator = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(seed));
    let dataset = orchestrator.run_with_progress(trials, |progress| {
        eprintln!();
        print_progress(progress);
    })?;

    eprintln!("------ Saving dataset -------");
    dataset_export::persist(&dataset, &config.output.human_log, &config.output.numeric_table)?;
    if let Some(path) = &config.output.json {
        dataset_export::persist_json(&dataset, path)?;
    }

    if verbose {
        eprintln!("Human log: {}", config.output.human_log.display());
        eprintln!("Numeric table: {}", config.output.numeric_table.display());
    }

    Ok(RunSummary::from_dataset(&dataset, Some(seed), start.elapsed()))
}

fn main() -> Result<(), RunnerError> {
    // Initialize tracing subscriber with RUST_LOG env filter
    // Default to "warn" level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    debug!(?config, "resolved configuration");

    let trials = match config.run.trials {
        Some(trials) => trials,
        None => prompt_trial_count()?,
    };

    let seed = config.run.seed.unwrap_or_else(|| {
        use rand::Rng;
        rand::thread_rng().gen()
    });

    let summary = run_trials(config, trials, seed, cli.verbose)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("90").unwrap(), 90.0);
        assert_eq!(parse_timeout(" 2m ").unwrap(), 120.0);
        assert_eq!(parse_timeout("1h").unwrap(), 3600.0);
        assert_eq!(parse_timeout("0.5s").unwrap(), 0.5);
        assert!(parse_timeout("5x").is_err());
        assert!(parse_timeout("m").is_err());
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("-3").is_err());
        assert!(parse_timeout("1h30m").is_err());
    }

    #[test]
    fn test_cli_rejects_oversized_timeout() {
        // Parses as seconds, but cannot be represented as a Duration
        let cli = Cli::parse_from(["nrtrial", "--trials", "1", "--timeout", "1e20"]);
        assert!(matches!(cli.resolve_config(), Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_parse_trial_count() {
        assert_eq!(parse_trial_count("3\n").unwrap(), 3);
        assert_eq!(parse_trial_count("  12 ").unwrap(), 12);
        assert!(matches!(parse_trial_count("0"), Err(RunnerError::InvalidTrialCount(_))));
        assert!(matches!(parse_trial_count("-4"), Err(RunnerError::InvalidTrialCount(_))));
        assert!(matches!(parse_trial_count("three"), Err(RunnerError::InvalidTrialCount(_))));
        assert!(matches!(parse_trial_count(""), Err(RunnerError::InvalidTrialCount(_))));
    }

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from([
            "nrtrial",
            "--trials",
            "4",
            "--seed",
            "7",
            "--timeout",
            "2m",
            "--numeric-table",
            "table.txt",
            "--",
            "sh",
            "-c",
            "echo hi",
        ]);
        let config = cli.resolve_config().unwrap();

        assert_eq!(config.run.trials, Some(4));
        assert_eq!(config.run.seed, Some(7));
        assert_eq!(config.simulator.timeout_s, Some(120.0));
        assert_eq!(config.simulator.command, "sh");
        assert_eq!(config.simulator.args, vec!["-c", "echo hi"]);
        assert_eq!(config.output.numeric_table, PathBuf::from("table.txt"));
    }

    #[test]
    fn test_cli_rejects_zero_trials() {
        let cli = Cli::parse_from(["nrtrial", "--trials", "0"]);
        assert!(matches!(cli.resolve_config(), Err(RunnerError::Config(_))));
    }
}
