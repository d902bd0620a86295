//! Line telemetry extraction.
//!
//! The simulator interleaves the values we care about with arbitrary
//! diagnostic output. Each metric is announced by a literal marker and closed
//! by a literal terminator:
//!
//! ```text
//! RSSI: <float> dBm
//! SE: <float> bps/Hz
//! Position(<float>, <float>[, <float>])
//! ```
//!
//! A line yields at most one observation. Markers are tried in the order
//! above and the first one present decides the outcome, so a marker with
//! broken text after it is an error even if a later marker would parse.

use nrtrial_common::{ObservationKind, Position, RawObservation, TelemetryError};
use regex::Regex;
use std::sync::OnceLock;

/// One `marker <value> terminator` rule.
#[derive(Debug)]
struct LineGrammar {
    kind: ObservationKind,
    marker: &'static str,
    terminator: &'static str,
    /// Named capture group holding the value text.
    group: &'static str,
    pattern: Regex,
}

impl LineGrammar {
    fn new(
        kind: ObservationKind,
        marker: &'static str,
        terminator: &'static str,
        group: &'static str,
    ) -> Self {
        // Lazy match stops at the first terminator after the marker
        let source = format!(
            "{}(?P<{}>.*?){}",
            regex::escape(marker),
            group,
            regex::escape(terminator)
        );
        let pattern =
            Regex::new(&source).expect("telemetry grammar is built from escaped literals");
        LineGrammar {
            kind,
            marker,
            terminator,
            group,
            pattern,
        }
    }

    fn extract(&self, line: &str) -> Option<Result<RawObservation, TelemetryError>> {
        if !line.contains(self.marker) {
            return None;
        }

        let Some(captures) = self.pattern.captures(line) else {
            return Some(Err(TelemetryError::MissingTerminator {
                kind: self.kind,
                terminator: self.terminator,
            }));
        };
        let text = captures.name(self.group).map_or("", |m| m.as_str());

        Some(self.decode(text))
    }

    fn decode(&self, text: &str) -> Result<RawObservation, TelemetryError> {
        match self.kind {
            ObservationKind::ReceivedSignalStrength => {
                parse_real(self.kind, text).map(RawObservation::ReceivedSignalStrength)
            }
            ObservationKind::SpectralEfficiency => {
                parse_real(self.kind, text).map(RawObservation::SpectralEfficiency)
            }
            ObservationKind::Position => parse_position(text).map(RawObservation::Position),
        }
    }
}

fn parse_real(kind: ObservationKind, text: &str) -> Result<f64, TelemetryError> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(TelemetryError::MalformedNumber {
            kind,
            text: text.to_string(),
        }),
    }
}

fn parse_position(text: &str) -> Result<Position, TelemetryError> {
    let bad = || TelemetryError::BadCoordinates {
        text: text.to_string(),
    };

    let coords = text
        .split(',')
        .map(|part| part.trim().parse::<f64>().ok().filter(|v| v.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(bad)?;

    Position::from_coords(&coords).ok_or_else(bad)
}

/// Stateless parser from one simulator output line to zero or one observation.
#[derive(Debug)]
pub struct TelemetryExtractor {
    grammars: Vec<LineGrammar>,
}

impl TelemetryExtractor {
    /// Build the extractor with the simulator's line grammars.
    pub fn new() -> Self {
        TelemetryExtractor {
            grammars: vec![
                LineGrammar::new(
                    ObservationKind::ReceivedSignalStrength,
                    "RSSI: ",
                    " dBm",
                    "rssi",
                ),
                LineGrammar::new(ObservationKind::SpectralEfficiency, "SE: ", " bps/Hz", "se"),
                LineGrammar::new(ObservationKind::Position, "Position(", ")", "position"),
            ],
        }
    }

    /// Decode one line.
    ///
    /// `Ok(None)` means the line carries no telemetry, which is the common case.
    /// An error means a marker was present but its value could not be read.
    pub fn extract(&self, line: &str) -> Result<Option<RawObservation>, TelemetryError> {
        self.grammars
            .iter()
            .find_map(|grammar| grammar.extract(line))
            .transpose()
    }
}

impl Default for TelemetryExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one line with a shared extractor.
pub fn extract(line: &str) -> Result<Option<RawObservation>, TelemetryError> {
    static EXTRACTOR: OnceLock<TelemetryExtractor> = OnceLock::new();
    EXTRACTOR.get_or_init(TelemetryExtractor::new).extract(line)
}
