//! # nrtrial-runner library
//!
//! Library interface for the NR trial harvester.
//!
//! A run executes a fixed number of simulator trials strictly one after
//! another, turns each trial's output into a normalized dataset row, and
//! finally persists the dataset:
//!
//! ```text
//! Orchestrator -> (TrialLauncher -> TelemetryExtractor -> nrtrial_link) x N -> dataset_export
//! ```
//!
//! ## Sequential Trials
//!
//! The simulator writes its own output files into its working tree, so two
//! trials cannot share a tree safely. Trials therefore never overlap, and
//! dataset order is launch order.
//!
//! ## Failure Policy
//!
//! - A malformed telemetry line is skipped; the trial continues.
//! - A simulator that exits non-zero or times out still produces a row from
//!   whatever it printed; the row is flagged as degraded.
//! - A simulator that cannot be launched aborts the run; nothing is persisted.
//! - A persistence failure leaves the in-memory dataset intact for a retry.

pub mod dataset_export;
pub mod telemetry;
pub mod trial;

pub use nrtrial_common::{Dataset, DatasetEntry, NormalizedRecord, TrialOutcome, TrialRecord};
pub use telemetry::{extract, TelemetryExtractor};
pub use trial::{run_trial, SimulatorCommand, TrialFold, TrialLauncher, TrialReport};

use nrtrial_link::{draw_user_priority, normalize, trial_record};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during a run.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The simulator process could not be started.
    #[error("Failed to launch simulator `{command}`: {source}")]
    Launch {
        /// Command line that was attempted.
        command: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Trial count that is not a positive integer.
    #[error("Trial count must be a positive integer, got {0:?}")]
    InvalidTrialCount(String),

    /// An output file could not be opened or written.
    #[error("Failed to write {}: {source}", path.display())]
    Persist {
        /// Destination path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Dataset built out of trial order.
    #[error("Dataset error: {0}")]
    Dataset(#[from] nrtrial_common::DatasetError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] nrtrial_model::ConfigError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Progress information passed to the progress callback after each trial.
#[derive(Debug, Clone)]
pub struct TrialProgress<'a> {
    /// Total number of trials in the run.
    pub total: usize,
    /// Entry just appended to the dataset.
    pub entry: &'a DatasetEntry,
    /// Wall time of this trial.
    pub trial_elapsed: Duration,
    /// Wall time since the run started.
    pub wall_elapsed: Duration,
}

// ============================================================================
// Run Summary
// ============================================================================

/// Statistics for a finished run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Trials run.
    pub trials: usize,
    /// Trials whose simulator exited cleanly.
    pub completed: usize,
    /// Trials that failed or timed out.
    pub degraded: usize,
    /// Malformed telemetry lines skipped across all trials.
    pub skipped_lines: usize,
    /// Seed of the user priority draw.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Wall clock time in milliseconds.
    pub wall_time_ms: u64,
}

impl RunSummary {
    /// Summarize `dataset`.
    pub fn from_dataset(dataset: &Dataset, seed: Option<u64>, wall_time: Duration) -> Self {
        let degraded = dataset.degraded_count();
        RunSummary {
            trials: dataset.len(),
            completed: dataset.len() - degraded,
            degraded,
            skipped_lines: dataset.iter().map(|e| e.skipped_lines).sum(),
            seed,
            wall_time_ms: wall_time.as_millis() as u64,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs trials sequentially and accumulates the dataset.
///
/// The random source for the user priority is injected; pass a seeded RNG to
/// make the priority column reproducible.
pub struct Orchestrator<L, R> {
    launcher: L,
    rng: R,
}

impl<L: TrialLauncher, R: Rng> Orchestrator<L, R> {
    /// Create an orchestrator.
    pub fn new(launcher: L, rng: R) -> Self {
        Orchestrator { launcher, rng }
    }

    /// Get the trial launcher.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Run `trial_count` trials.
    pub fn run(&mut self, trial_count: usize) -> Result<Dataset, RunnerError> {
        self.run_with_progress(trial_count, |_| {})
    }

    /// Run `trial_count` trials, calling `on_progress` as each one completes.
    ///
    /// Returns a dataset with exactly `trial_count` entries, or the first
    /// launch error.
    pub fn run_with_progress<F>(
        &mut self,
        trial_count: usize,
        mut on_progress: F,
    ) -> Result<Dataset, RunnerError>
    where
        F: FnMut(&TrialProgress<'_>),
    {
        if trial_count == 0 {
            return Err(RunnerError::InvalidTrialCount(trial_count.to_string()));
        }

        let start = Instant::now();
        let mut dataset = Dataset::with_capacity(trial_count);

        for index in 1..=trial_count {
            info!(trial = index, total = trial_count, "running trial");
            let report = self.launcher.run_trial(index)?;

            let user_priority = draw_user_priority(&mut self.rng);
            let record = trial_record(&report.telemetry, user_priority);
            let normalized = normalize(&record);

            if report.outcome.is_degraded() {
                warn!(
                    trial = index,
                    outcome = %report.outcome,
                    "trial degraded, keeping partial telemetry"
                );
            }
            info!(
                trial = index,
                rssi_dbm = record.rssi_dbm,
                se_bps_hz = record.spectral_efficiency_bps_hz,
                position = ?record.position,
                cv = normalized.channel_value,
                up = normalized.user_priority,
                se_norm = normalized.spectral_efficiency_norm,
                "trial complete"
            );

            dataset.push(DatasetEntry {
                index,
                outcome: report.outcome,
                skipped_lines: report.skipped_lines,
                record,
                normalized,
            })?;

            if let Some(entry) = dataset.entries().last() {
                on_progress(&TrialProgress {
                    total: trial_count,
                    entry,
                    trial_elapsed: report.elapsed,
                    wall_elapsed: start.elapsed(),
                });
            }
        }

        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrtrial_common::{RawObservation, TrialTelemetry};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::VecDeque;

    /// Launcher replaying canned trial results.
    struct ScriptedLauncher {
        trials: VecDeque<Result<TrialReport, RunnerError>>,
        launched: usize,
    }

    impl ScriptedLauncher {
        fn new(trials: Vec<Result<TrialReport, RunnerError>>) -> Self {
            ScriptedLauncher {
                trials: trials.into(),
                launched: 0,
            }
        }
    }

    impl TrialLauncher for ScriptedLauncher {
        fn run_trial(&mut self, _index: usize) -> Result<TrialReport, RunnerError> {
            self.launched += 1;
            self.trials.pop_front().expect("more trials launched than scripted")
        }
    }

    fn report(
        observations: &[RawObservation],
        outcome: TrialOutcome,
    ) -> Result<TrialReport, RunnerError> {
        let mut telemetry = TrialTelemetry::new();
        for obs in observations {
            telemetry.apply(*obs);
        }
        Ok(TrialReport {
            telemetry,
            outcome,
            lines_read: observations.len(),
            skipped_lines: 0,
            elapsed: Duration::from_millis(5),
        })
    }

    fn launch_error() -> RunnerError {
        RunnerError::Launch {
            command: "./ns3".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        }
    }

    #[test]
    fn test_zero_trials_rejected_before_launch() {
        let mut orchestrator =
            Orchestrator::new(ScriptedLauncher::new(vec![]), ChaCha8Rng::seed_from_u64(1));
        let err = orchestrator.run(0).unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTrialCount(_)));
        assert_eq!(orchestrator.launcher().launched, 0);
    }

    #[test]
    fn test_three_trial_scenario() {
        let launcher = ScriptedLauncher::new(vec![
            report(
                &[
                    RawObservation::ReceivedSignalStrength(-95.0),
                    RawObservation::SpectralEfficiency(4.0),
                ],
                TrialOutcome::Completed,
            ),
            report(&[RawObservation::ReceivedSignalStrength(-60.0)], TrialOutcome::Completed),
            report(&[], TrialOutcome::Completed),
        ]);
        let mut orchestrator = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(42));

        let mut seen = Vec::new();
        let dataset = orchestrator
            .run_with_progress(3, |p| seen.push((p.entry.index, p.total)))
            .unwrap();

        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert_eq!(dataset.len(), 3);

        let cv: Vec<f64> = dataset.normalized().map(|n| n.channel_value).collect();
        let se: Vec<f64> = dataset.normalized().map(|n| n.spectral_efficiency_norm).collect();
        assert!((cv[0] - 25.0 / 130.0).abs() < 1e-12);
        assert!((cv[1] - 60.0 / 130.0).abs() < 1e-12);
        assert!((cv[2] - 120.0 / 130.0).abs() < 1e-12);
        assert!((se[0] - 0.4).abs() < 1e-12);
        assert_eq!(se[1], 0.0);
        assert_eq!(se[2], 0.0);
        for n in dataset.normalized() {
            assert!((0.0..=1.0).contains(&n.user_priority));
        }
    }

    #[test]
    fn test_failed_trial_keeps_partial_telemetry() {
        let launcher = ScriptedLauncher::new(vec![
            report(
                &[RawObservation::ReceivedSignalStrength(-70.0)],
                TrialOutcome::Failed { exit_code: Some(1) },
            ),
            report(&[], TrialOutcome::TimedOut { after_ms: 1000 }),
        ]);
        let mut orchestrator = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(3));

        let dataset = orchestrator.run(2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.degraded_count(), 2);
        assert_eq!(dataset.entries()[0].record.rssi_dbm, -70.0);
        assert!((dataset.entries()[0].normalized.channel_value - 50.0 / 130.0).abs() < 1e-12);
    }

    #[test]
    fn test_launch_error_aborts_run() {
        let launcher = ScriptedLauncher::new(vec![
            report(&[], TrialOutcome::Completed),
            Err(launch_error()),
            report(&[], TrialOutcome::Completed),
        ]);
        let mut orchestrator = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(3));

        let err = orchestrator.run(3).unwrap_err();
        assert!(matches!(err, RunnerError::Launch { .. }));
        assert_eq!(orchestrator.launcher().launched, 2);
    }

    #[test]
    fn test_seeded_priorities_reproducible() {
        let run = |seed| {
            let launcher = ScriptedLauncher::new(vec![
                report(&[], TrialOutcome::Completed),
                report(&[], TrialOutcome::Completed),
            ]);
            let mut orchestrator = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(seed));
            orchestrator
                .run(2)
                .unwrap()
                .normalized()
                .map(|n| n.user_priority)
                .collect::<Vec<f64>>()
        };

        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[test]
    fn test_run_summary() {
        let launcher = ScriptedLauncher::new(vec![
            report(&[], TrialOutcome::Completed),
            report(&[], TrialOutcome::Failed { exit_code: None }),
        ]);
        let dataset = Orchestrator::new(launcher, ChaCha8Rng::seed_from_u64(0)).run(2).unwrap();

        let summary = RunSummary::from_dataset(&dataset, Some(0), Duration::from_millis(1500));
        assert_eq!(summary.trials, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.wall_time_ms, 1500);
    }
}
