//! # nrtrial-common
//!
//! Common types for the NR trial harvester.
//!
//! This crate provides the data model shared by the rest of the workspace:
//! - Telemetry observations ([`RawObservation`], [`ObservationKind`], [`Position`])
//! - Per-trial reduction of the observation stream ([`TrialTelemetry`])
//! - Trial completion signal ([`TrialOutcome`])
//! - Dataset records ([`TrialRecord`], [`NormalizedRecord`], [`DatasetEntry`], [`Dataset`])
//! - Line-level parse errors ([`TelemetryError`]) and dataset ordering errors
//!   ([`DatasetError`])

use serde::Serialize;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while decoding a single telemetry line.
///
/// These are always scoped to one line; the trial runner skips the line and
/// keeps whatever value it already had for that kind.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    /// Marker found, but the text up to its terminator is not a number.
    #[error("malformed {kind} value: {text:?}")]
    MalformedNumber {
        /// Kind announced by the marker.
        kind: ObservationKind,
        /// Text found between marker and terminator.
        text: String,
    },

    /// Marker found without its terminator on the same line.
    #[error("{kind} marker without terminator {terminator:?}")]
    MissingTerminator {
        /// Kind announced by the marker.
        kind: ObservationKind,
        /// Terminator that was expected.
        terminator: &'static str,
    },

    /// Coordinate list that is not two or three comma-separated numbers.
    #[error("malformed position coordinates: {text:?}")]
    BadCoordinates {
        /// Text found between the parentheses.
        text: String,
    },
}

/// Errors raised while building a [`Dataset`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasetError {
    /// Entry index does not follow the last entry's.
    #[error("dataset entry {got} out of order, expected trial {expected}")]
    OutOfOrder {
        /// Index the next entry must carry.
        expected: usize,
        /// Index it actually carried.
        got: usize,
    },
}

// ============================================================================
// Observations
// ============================================================================

/// Kind of a telemetry observation. The unit of the value is implied by the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// Received signal strength, dBm.
    ReceivedSignalStrength,
    /// Spectral efficiency, bps/Hz.
    SpectralEfficiency,
    /// UE position, simulator coordinates.
    Position,
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationKind::ReceivedSignalStrength => write!(f, "RSSI"),
            ObservationKind::SpectralEfficiency => write!(f, "SE"),
            ObservationKind::Position => write!(f, "Position"),
        }
    }
}

/// A UE position as reported by the simulator: a pair or a triple.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    /// Build a position from an ordered coordinate list.
    ///
    /// Returns `None` unless the list holds exactly two or three values.
    pub fn from_coords(coords: &[f64]) -> Option<Self> {
        match *coords {
            [x, y] => Some(Position { x, y, z: None }),
            [x, y, z] => Some(Position { x, y, z: Some(z) }),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.z {
            Some(z) => write!(f, "{}, {}, {}", self.x, self.y, z),
            None => write!(f, "{}, {}", self.x, self.y),
        }
    }
}

/// One decoded telemetry event from a single simulator output line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawObservation {
    /// Received signal strength in dBm.
    ReceivedSignalStrength(f64),
    /// Spectral efficiency in bps/Hz.
    SpectralEfficiency(f64),
    /// UE position.
    Position(Position),
}

impl RawObservation {
    /// Kind of this observation.
    pub fn kind(&self) -> ObservationKind {
        match self {
            RawObservation::ReceivedSignalStrength(_) => ObservationKind::ReceivedSignalStrength,
            RawObservation::SpectralEfficiency(_) => ObservationKind::SpectralEfficiency,
            RawObservation::Position(_) => ObservationKind::Position,
        }
    }
}

// ============================================================================
// Trial Reduction
// ============================================================================

/// Fold of one trial's observation stream, last value wins per kind.
///
/// Starts empty, is fed by the trial runner while the simulator output is
/// open, and is frozen once the stream closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrialTelemetry {
    /// Last received signal strength seen, dBm.
    pub rssi_dbm: Option<f64>,
    /// Last spectral efficiency seen, bps/Hz.
    pub spectral_efficiency_bps_hz: Option<f64>,
    /// Last position seen.
    pub position: Option<Position>,
    /// Number of observations folded in.
    pub observations: u64,
}

impl TrialTelemetry {
    /// Create an empty fold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observation in, replacing any previous value of the same kind.
    pub fn apply(&mut self, observation: RawObservation) {
        match observation {
            RawObservation::ReceivedSignalStrength(v) => self.rssi_dbm = Some(v),
            RawObservation::SpectralEfficiency(v) => self.spectral_efficiency_bps_hz = Some(v),
            RawObservation::Position(p) => self.position = Some(p),
        }
        self.observations += 1;
    }

    /// True when no observation was folded in.
    pub fn is_empty(&self) -> bool {
        self.observations == 0
    }
}

/// How a trial's simulator process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    /// Process exited with status zero.
    Completed,
    /// Process exited with a non-zero status, or was terminated by a signal
    /// (`exit_code` is then `None`).
    Failed { exit_code: Option<i32> },
    /// Process was killed after exceeding the configured timeout.
    TimedOut { after_ms: u64 },
}

impl TrialOutcome {
    /// True for any outcome other than a clean exit.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, TrialOutcome::Completed)
    }
}

impl fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrialOutcome::Completed => write!(f, "completed"),
            TrialOutcome::Failed { exit_code: Some(code) } => {
                write!(f, "failed (exit code {})", code)
            }
            TrialOutcome::Failed { exit_code: None } => write!(f, "failed (terminated by signal)"),
            TrialOutcome::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
        }
    }
}

// ============================================================================
// Dataset Records
// ============================================================================

/// Raw per-trial values, with defaults applied for anything the trial never reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    /// Received signal strength, dBm (0.0 when never seen).
    pub rssi_dbm: f64,
    /// Spectral efficiency, bps/Hz (0.0 when never seen).
    pub spectral_efficiency_bps_hz: f64,
    /// Last UE position, if any.
    pub position: Option<Position>,
    /// Exogenous scheduling priority in [0, 1].
    pub user_priority: f64,
}

/// A trial record mapped into dataset units.
///
/// Values are not clamped; out-of-calibration telemetry yields values outside [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NormalizedRecord {
    /// Channel value (CV) derived from RSSI.
    pub channel_value: f64,
    /// User priority (UP).
    pub user_priority: f64,
    /// Normalized spectral efficiency (SE).
    pub spectral_efficiency_norm: f64,
}

/// One dataset row with the context needed to report it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetEntry {
    /// 1-based trial index, equal to launch order.
    pub index: usize,
    /// How the simulator process ended.
    pub outcome: TrialOutcome,
    /// Lines skipped because a marker was followed by malformed text.
    pub skipped_lines: usize,
    /// Raw values.
    pub record: TrialRecord,
    /// Normalized values.
    pub normalized: NormalizedRecord,
}

/// Ordered collection of dataset entries, one per trial, in trial order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Dataset {
    entries: Vec<DatasetEntry>,
}

impl Dataset {
    /// Create an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty dataset sized for `trials` entries.
    pub fn with_capacity(trials: usize) -> Self {
        Dataset {
            entries: Vec::with_capacity(trials),
        }
    }

    /// Append the entry for the next trial.
    ///
    /// Entries must arrive in trial order, starting at index 1; anything else
    /// is rejected and the dataset is left unchanged.
    pub fn push(&mut self, entry: DatasetEntry) -> Result<(), DatasetError> {
        let expected = self.entries.len() + 1;
        if entry.index != expected {
            return Err(DatasetError::OutOfOrder {
                expected,
                got: entry.index,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the dataset holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in trial order.
    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    /// Iterate over entries in trial order.
    pub fn iter(&self) -> std::slice::Iter<'_, DatasetEntry> {
        self.entries.iter()
    }

    /// Iterate over the normalized records in trial order.
    pub fn normalized(&self) -> impl Iterator<Item = &NormalizedRecord> + '_ {
        self.entries.iter().map(|e| &e.normalized)
    }

    /// Number of trials whose simulator did not exit cleanly.
    pub fn degraded_count(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome.is_degraded()).count()
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a DatasetEntry;
    type IntoIter = std::slice::Iter<'a, DatasetEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
