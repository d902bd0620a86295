//! # nrtrial-model
//!
//! Run configuration for the NR trial harvester.
//!
//! Configuration is read from zero or more YAML files. Files are merged in
//! order, later files overriding earlier ones field by field, and anything
//! left unset falls back to the built-in defaults, which reproduce the
//! reference setup (`./ns3 run scratch/5GsimNS3/5Gmain.cc`).
//!
//! ## Example YAML
//!
//! ```yaml
//! simulator:
//!   command: ./ns3
//!   args: ["run", "scratch/5GsimNS3/5Gmain.cc"]
//!   working_dir: /opt/ns-3-dev
//!   timeout_s: 120
//! output:
//!   human_log: rssi_se_position.txt
//!   numeric_table: data_5G-raw.txt
//!   json: dataset.json
//! run:
//!   trials: 50
//!   seed: 42
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Defaults
// ============================================================================

/// Simulator entry point of the reference setup.
pub const DEFAULT_SIMULATOR_COMMAND: &str = "./ns3";

/// Arguments of the reference setup.
pub const DEFAULT_SIMULATOR_ARGS: [&str; 2] = ["run", "scratch/5GsimNS3/5Gmain.cc"];

/// Default human-readable per-trial log.
pub const DEFAULT_HUMAN_LOG: &str = "rssi_se_position.txt";

/// Default numeric table (`CV UP SE` per line).
pub const DEFAULT_NUMERIC_TABLE: &str = "data_5G-raw.txt";

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error reading {}: {source}", path.display())]
    IoError {
        /// File being read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// Resolved Configuration
// ============================================================================

/// How to invoke the external simulator for one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Executable to launch.
    pub command: String,
    /// Arguments passed on every trial.
    pub args: Vec<String>,
    /// Working directory for the child process (inherited when `None`).
    pub working_dir: Option<PathBuf>,
    /// Kill the child and mark the trial timed out after this many seconds.
    pub timeout_s: Option<f64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        SimulatorConfig {
            command: DEFAULT_SIMULATOR_COMMAND.to_string(),
            args: DEFAULT_SIMULATOR_ARGS.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
            timeout_s: None,
        }
    }
}

impl SimulatorConfig {
    /// Trial timeout, if one is set.
    ///
    /// Fails for values that are not positive or do not fit a [`Duration`].
    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(secs) = self.timeout_s else {
            return Ok(None);
        };
        let invalid = || {
            ConfigError::InvalidConfig(format!(
                "simulator.timeout_s must be a positive number of seconds, got {}",
                secs
            ))
        };
        if secs <= 0.0 {
            return Err(invalid());
        }
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|_| invalid())
    }
}

/// Where the dataset is written.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    /// Human-readable per-trial log.
    pub human_log: PathBuf,
    /// Whitespace-separated `CV UP SE` table.
    pub numeric_table: PathBuf,
    /// Optional JSON export of the full dataset.
    pub json: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            human_log: PathBuf::from(DEFAULT_HUMAN_LOG),
            numeric_table: PathBuf::from(DEFAULT_NUMERIC_TABLE),
            json: None,
        }
    }
}

/// Run parameters. Both are optional: the CLI prompts for the trial count and
/// draws a seed from entropy when they are missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSection {
    /// Number of trials.
    pub trials: Option<usize>,
    /// Seed for the user priority draw.
    pub seed: Option<u64>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    pub simulator: SimulatorConfig,
    pub output: OutputConfig,
    pub run: RunSection,
}

impl RunConfig {
    /// Check values that cannot be expressed in the YAML schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulator.command.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "simulator.command must not be empty".to_string(),
            ));
        }
        self.simulator.timeout()?;
        if self.run.trials == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "run.trials must be at least 1".to_string(),
            ));
        }
        if self.output.human_log == self.output.numeric_table {
            return Err(ConfigError::InvalidConfig(format!(
                "output.human_log and output.numeric_table both point to {}",
                self.output.human_log.display()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Unresolved (per-file) Configuration
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialSimulator {
    command: Option<String>,
    args: Option<Vec<String>>,
    working_dir: Option<PathBuf>,
    timeout_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialOutput {
    human_log: Option<PathBuf>,
    numeric_table: Option<PathBuf>,
    json: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialRun {
    trials: Option<usize>,
    seed: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    #[serde(default)]
    simulator: PartialSimulator,
    #[serde(default)]
    output: PartialOutput,
    #[serde(default)]
    run: PartialRun,
}

impl PartialConfig {
    /// Overlay the fields set in `self` onto `config`.
    fn apply_to(self, config: &mut RunConfig) {
        let PartialConfig { simulator, output, run } = self;

        if let Some(command) = simulator.command {
            config.simulator.command = command;
        }
        if let Some(args) = simulator.args {
            config.simulator.args = args;
        }
        if simulator.working_dir.is_some() {
            config.simulator.working_dir = simulator.working_dir;
        }
        if simulator.timeout_s.is_some() {
            config.simulator.timeout_s = simulator.timeout_s;
        }

        if let Some(human_log) = output.human_log {
            config.output.human_log = human_log;
        }
        if let Some(numeric_table) = output.numeric_table {
            config.output.numeric_table = numeric_table;
        }
        if output.json.is_some() {
            config.output.json = output.json;
        }

        if run.trials.is_some() {
            config.run.trials = run.trials;
        }
        if run.seed.is_some() {
            config.run.seed = run.seed;
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load configuration from a single file.
pub fn load_config(path: &Path) -> Result<RunConfig, ConfigError> {
    load_configs(&[path])
}

/// Load and merge configuration files in order (later overrides earlier).
///
/// An empty list yields the validated defaults.
pub fn load_configs(paths: &[&Path]) -> Result<RunConfig, ConfigError> {
    let yaml_strings = paths
        .iter()
        .map(|path| {
            std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect::<Result<Vec<String>, ConfigError>>()?;
    let yaml_strs: Vec<&str> = yaml_strings.iter().map(|s| s.as_str()).collect();

    load_configs_from_str(&yaml_strs)
}

/// Parse and merge configuration from YAML strings in order.
pub fn load_configs_from_str(yaml_strs: &[&str]) -> Result<RunConfig, ConfigError> {
    let mut config = RunConfig::default();

    for yaml in yaml_strs {
        // An empty document deserializes to unit, not to an empty mapping
        if yaml.trim().is_empty() {
            continue;
        }
        let partial: PartialConfig = serde_yaml::from_str(yaml)?;
        partial.apply_to(&mut config);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_reference_setup() {
        let config = load_configs_from_str(&[]).unwrap();
        assert_eq!(config.simulator.command, "./ns3");
        assert_eq!(config.simulator.args, vec!["run", "scratch/5GsimNS3/5Gmain.cc"]);
        assert_eq!(config.output.human_log, PathBuf::from("rssi_se_position.txt"));
        assert_eq!(config.output.numeric_table, PathBuf::from("data_5G-raw.txt"));
        assert!(config.output.json.is_none());
        assert!(config.simulator.timeout_s.is_none());
        assert!(config.run.trials.is_none());
    }

    #[test]
    fn test_later_documents_override_earlier() {
        let base = r#"
simulator:
  command: /usr/bin/sim
  args: ["--fast"]
run:
  trials: 5
  seed: 1
"#;
        let site = r#"
simulator:
  timeout_s: 30
run:
  seed: 9
"#;
        let config = load_configs_from_str(&[base, site]).unwrap();
        assert_eq!(config.simulator.command, "/usr/bin/sim");
        assert_eq!(config.simulator.args, vec!["--fast"]);
        assert_eq!(config.simulator.timeout_s, Some(30.0));
        assert_eq!(config.run.trials, Some(5));
        assert_eq!(config.run.seed, Some(9));
        // Untouched sections keep their defaults
        assert_eq!(config.output.numeric_table, PathBuf::from(DEFAULT_NUMERIC_TABLE));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = load_configs_from_str(&["simulator:\n  comand: ./ns3\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn test_validation() {
        let err = load_configs_from_str(&["run:\n  trials: 0\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));

        let err = load_configs_from_str(&["simulator:\n  timeout_s: -1\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));

        let err = load_configs_from_str(&["simulator:\n  timeout_s: .nan\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));

        let err = load_configs_from_str(&["simulator:\n  command: \"  \"\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));

        let same = "output:\n  human_log: out.txt\n  numeric_table: out.txt\n";
        assert!(matches!(
            load_configs_from_str(&[same]).unwrap_err(),
            ConfigError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_timeout_conversion() {
        let mut simulator = SimulatorConfig::default();
        assert_eq!(simulator.timeout().unwrap(), None);

        simulator.timeout_s = Some(0.5);
        assert_eq!(simulator.timeout().unwrap(), Some(Duration::from_millis(500)));

        // Finite but beyond what a Duration can hold
        simulator.timeout_s = Some(1e20);
        assert!(matches!(simulator.timeout(), Err(ConfigError::InvalidConfig(_))));

        let err = load_configs_from_str(&["simulator:\n  timeout_s: 1.0e20\n"]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "output:\n  json: dataset.json").unwrap();
        drop(file);

        let config = load_config(&path).unwrap();
        assert_eq!(config.output.json, Some(PathBuf::from("dataset.json")));

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            load_config(&missing).unwrap_err(),
            ConfigError::IoError { .. }
        ));
    }
}
