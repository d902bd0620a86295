//! Single-trial execution.
//!
//! A trial launches the simulator as a child process, reads its standard
//! output line by line until the stream closes, folds every observation into a
//! [`TrialTelemetry`], then waits for the child to exit. The exit status only
//! changes the [`TrialOutcome`]: telemetry collected before a failure is kept.
//!
//! Output is read on a dedicated thread and handed over a channel so the
//! optional timeout can be enforced without non-blocking I/O. With a timeout
//! set, the simulator gets its own process group and the whole group is
//! killed on expiry, including anything a wrapper script started.

use crate::telemetry::TelemetryExtractor;
use crate::RunnerError;
use nrtrial_common::{TrialOutcome, TrialTelemetry};
use nrtrial_model::SimulatorConfig;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

// ============================================================================
// Trial Report
// ============================================================================

/// Result of one simulator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    /// Observations folded from the output stream.
    pub telemetry: TrialTelemetry,
    /// How the process ended.
    pub outcome: TrialOutcome,
    /// Output lines read.
    pub lines_read: usize,
    /// Lines skipped because their telemetry was malformed.
    pub skipped_lines: usize,
    /// Wall time from launch to exit.
    pub elapsed: Duration,
}

/// Source of trial reports for the orchestrator.
pub trait TrialLauncher {
    /// Run trial `index` (1-based) to completion.
    ///
    /// Only a launch failure is an error. A process that starts and then
    /// fails is reported through [`TrialReport::outcome`].
    fn run_trial(&mut self, index: usize) -> Result<TrialReport, RunnerError>;
}

impl<L: TrialLauncher + ?Sized> TrialLauncher for &mut L {
    fn run_trial(&mut self, index: usize) -> Result<TrialReport, RunnerError> {
        (**self).run_trial(index)
    }
}

// ============================================================================
// Stream Folding
// ============================================================================

/// Incremental reduction of one trial's output lines.
#[derive(Debug)]
pub struct TrialFold<'a> {
    extractor: &'a TelemetryExtractor,
    trial: usize,
    telemetry: TrialTelemetry,
    lines_read: usize,
    skipped_lines: usize,
}

impl<'a> TrialFold<'a> {
    /// Start an empty fold for trial `trial`.
    pub fn new(extractor: &'a TelemetryExtractor, trial: usize) -> Self {
        TrialFold {
            extractor,
            trial,
            telemetry: TrialTelemetry::new(),
            lines_read: 0,
            skipped_lines: 0,
        }
    }

    /// Feed one output line. Malformed telemetry is logged and skipped.
    pub fn feed(&mut self, line: &str) {
        self.lines_read += 1;
        trace!(trial = self.trial, line, "simulator output");

        match self.extractor.extract(line) {
            Ok(Some(observation)) => {
                debug!(trial = self.trial, ?observation, "telemetry");
                self.telemetry.apply(observation);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(trial = self.trial, error = %e, line, "skipping malformed telemetry line");
                self.skipped_lines += 1;
            }
        }
    }

    /// Number of lines fed so far.
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    /// Number of lines skipped so far.
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Freeze the fold into a report.
    pub fn finish(self, outcome: TrialOutcome, elapsed: Duration) -> TrialReport {
        TrialReport {
            telemetry: self.telemetry,
            outcome,
            lines_read: self.lines_read,
            skipped_lines: self.skipped_lines,
            elapsed,
        }
    }
}

// ============================================================================
// Simulator Process
// ============================================================================

/// Launches the external simulator once per trial.
#[derive(Debug)]
pub struct SimulatorCommand {
    config: SimulatorConfig,
    extractor: TelemetryExtractor,
}

impl SimulatorCommand {
    /// Create a launcher from configuration.
    pub fn new(config: SimulatorConfig) -> Self {
        SimulatorCommand {
            config,
            extractor: TelemetryExtractor::new(),
        }
    }

    /// Create a launcher for `command args...` with no timeout.
    pub fn from_command(command: impl Into<String>, args: &[String]) -> Self {
        Self::new(SimulatorConfig {
            command: command.into(),
            args: args.to_vec(),
            working_dir: None,
            timeout_s: None,
        })
    }

    /// Configuration this launcher runs with.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Command line as shown in logs and errors.
    pub fn display_command(&self) -> String {
        std::iter::once(self.config.command.as_str())
            .chain(self.config.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn spawn(&self, own_process_group: bool) -> Result<Child, RunnerError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        // Without a timeout the child stays in our group so a terminal
        // interrupt reaches it too
        if own_process_group {
            isolate_process_group(&mut cmd);
        }

        cmd.spawn().map_err(|source| RunnerError::Launch {
            command: self.display_command(),
            source,
        })
    }
}

impl TrialLauncher for SimulatorCommand {
    fn run_trial(&mut self, index: usize) -> Result<TrialReport, RunnerError> {
        let timeout = self.config.timeout()?;
        let start = Instant::now();
        let mut child = self.spawn(timeout.is_some())?;
        debug!(
            trial = index,
            pid = child.id(),
            command = %self.display_command(),
            "simulator started"
        );

        let lines = match child.stdout.take() {
            Some(stdout) => spawn_line_reader(stdout, index)?,
            None => {
                let _ = child.kill();
                return Err(RunnerError::Launch {
                    command: self.display_command(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "stdout was not captured",
                    ),
                });
            }
        };

        let deadline = timeout.map(|t| start + t);
        let mut fold = TrialFold::new(&self.extractor, index);
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(deadline) => {
                    match lines.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(line) => Some(line),
                        Err(RecvTimeoutError::Timeout) => {
                            timed_out = true;
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => None,
                    }
                }
                None => lines.recv().ok(),
            };

            match next {
                Some(Ok(line)) => fold.feed(&line),
                Some(Err(e)) => {
                    warn!(
                        trial = index,
                        error = %e,
                        "simulator output stream failed, treating as closed"
                    );
                    break;
                }
                None => break,
            }
        }

        if timed_out {
            warn!(
                trial = index,
                timeout_s = ?self.config.timeout_s,
                "simulator timed out, killing its process group"
            );
            if let Err(e) = kill_process_group(&mut child) {
                warn!(trial = index, error = %e, "failed to kill simulator");
            }
        }

        let status = child.wait()?;
        let elapsed = start.elapsed();

        let outcome = if timed_out {
            TrialOutcome::TimedOut {
                after_ms: elapsed.as_millis() as u64,
            }
        } else if status.success() {
            TrialOutcome::Completed
        } else {
            TrialOutcome::Failed {
                exit_code: status.code(),
            }
        };

        debug!(
            trial = index,
            %outcome,
            lines = fold.lines_read(),
            skipped = fold.skipped_lines(),
            elapsed_ms = elapsed.as_millis() as u64,
            "simulator finished"
        );
        Ok(fold.finish(outcome, elapsed))
    }
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

/// Kill the child and every process in its group.
#[cfg(unix)]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: killpg only signals; the child is unreaped, so its pid still
    // names the group it leads
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

/// Forward `stdout` line by line over a channel until it closes.
///
/// Lines are decoded lossily so stray non-UTF-8 bytes cannot end the stream.
fn spawn_line_reader<R>(
    stdout: R,
    trial: usize,
) -> Result<Receiver<std::io::Result<String>>, RunnerError>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();

    // Detached; ends once every process holding the pipe has exited
    thread::Builder::new()
        .name(format!("trial-{}-stdout", trial))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(|c| c == '\n' || c == '\r').to_string();
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

/// Run the simulator once with `command args...` and reduce its output.
pub fn run_trial(command: &str, args: &[String]) -> Result<TrialReport, RunnerError> {
    SimulatorCommand::from_command(command, args).run_trial(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrtrial_common::Position;

    fn fold_lines(lines: &[&str]) -> TrialReport {
        let extractor = TelemetryExtractor::new();
        let mut fold = TrialFold::new(&extractor, 1);
        for line in lines {
            fold.feed(line);
        }
        fold.finish(TrialOutcome::Completed, Duration::ZERO)
    }

    #[test]
    fn test_fold_keeps_last_value_per_kind() {
        let report = fold_lines(&[
            "Initial position of Node 2: (10, 20, 0)",
            "RSSI: -95.0 dBm",
            "Node 2: Position(1.0, 2.0, 0.0)",
            "SE: 4.0 bps/Hz",
            "RSSI: -90.0 dBm",
            "Node 2: Position(3.0, 4.0, 0.0)",
        ]);

        assert_eq!(report.telemetry.rssi_dbm, Some(-90.0));
        assert_eq!(report.telemetry.spectral_efficiency_bps_hz, Some(4.0));
        assert_eq!(
            report.telemetry.position,
            Some(Position { x: 3.0, y: 4.0, z: Some(0.0) })
        );
        assert_eq!(report.lines_read, 6);
        assert_eq!(report.skipped_lines, 0);
    }

    #[test]
    fn test_fold_skips_malformed_and_keeps_prior_value() {
        let report = fold_lines(&["RSSI: -80.0 dBm", "RSSI: ??? dBm", "SE: 1.5"]);

        assert_eq!(report.telemetry.rssi_dbm, Some(-80.0));
        assert_eq!(report.telemetry.spectral_efficiency_bps_hz, None);
        assert_eq!(report.skipped_lines, 2);
    }

    #[test]
    fn test_fold_ignores_sinr_lines() {
        let report = fold_lines(&[" SINR: 3.0 dB,", "RSSI: -95.0 dBm", " SINR: -1.0 dB,"]);

        assert_eq!(report.telemetry.rssi_dbm, Some(-95.0));
        assert_eq!(report.telemetry.spectral_efficiency_bps_hz, None);
        assert_eq!(report.telemetry.observations, 1);
        assert_eq!(report.skipped_lines, 0);

        let record = nrtrial_link::trial_record(&report.telemetry, 0.5);
        assert_eq!(record.spectral_efficiency_bps_hz, 0.0);
    }
}
