//! Dataset persistence.
//!
//! The dataset is written once, after all trials finished, to:
//! - a human-readable log, one line per trial with every raw field
//! - a numeric table, one `CV UP SE` line per trial, no header, no index
//! - optionally, a JSON document with the full entries
//!
//! Writers are generic over [`Write`] so the formats can be checked in memory;
//! [`persist`] and [`persist_json`] bind them to files.

use crate::RunnerError;
use nrtrial_common::{Dataset, DatasetEntry};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

// ============================================================================
// Formats
// ============================================================================

fn human_log_line(entry: &DatasetEntry) -> String {
    let record = &entry.record;
    let position = match &record.position {
        Some(p) => format!("({})", p),
        None => "n/a".to_string(),
    };

    let mut line = format!(
        "Iteration {}: RSSI = {} dBm, SE = {} bps/Hz, UE Position = {}, User priority = {}",
        entry.index,
        record.rssi_dbm,
        record.spectral_efficiency_bps_hz,
        position,
        record.user_priority
    );
    if entry.outcome.is_degraded() {
        line.push_str(&format!(", DEGRADED: {}", entry.outcome));
    }
    if entry.skipped_lines > 0 {
        line.push_str(&format!(", skipped lines = {}", entry.skipped_lines));
    }
    line
}

/// Write the human-readable log, one line per trial.
pub fn write_human_log<W: Write>(dataset: &Dataset, writer: &mut W) -> std::io::Result<()> {
    for entry in dataset {
        writeln!(writer, "{}", human_log_line(entry))?;
    }
    Ok(())
}

/// Write the numeric table: `channel_value user_priority spectral_efficiency_norm` per line.
pub fn write_numeric_table<W: Write>(dataset: &Dataset, writer: &mut W) -> std::io::Result<()> {
    for record in dataset.normalized() {
        writeln!(
            writer,
            "{} {} {}",
            record.channel_value, record.user_priority, record.spectral_efficiency_norm
        )?;
    }
    Ok(())
}

/// Export the dataset as JSON.
pub fn export_json<W: Write>(dataset: &Dataset, writer: &mut W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *writer, dataset)?;
    writeln!(writer)?;
    Ok(())
}

// ============================================================================
// File Output
// ============================================================================

fn persist_error(path: &Path) -> impl FnOnce(std::io::Error) -> RunnerError + '_ {
    move |source| RunnerError::Persist {
        path: path.to_path_buf(),
        source,
    }
}

/// Write the human log and the numeric table.
///
/// Both destinations are opened before anything is written. The human log is
/// appended to, so it accumulates across runs; the numeric table is truncated
/// and ends up with exactly one line per entry. On error the caller still owns
/// `dataset` and may retry.
pub fn persist(
    dataset: &Dataset,
    human_log_path: &Path,
    numeric_table_path: &Path,
) -> Result<(), RunnerError> {
    let human_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(human_log_path)
        .map_err(persist_error(human_log_path))?;
    let numeric_table =
        File::create(numeric_table_path).map_err(persist_error(numeric_table_path))?;

    let mut writer = BufWriter::new(human_log);
    write_human_log(dataset, &mut writer).map_err(persist_error(human_log_path))?;
    writer.flush().map_err(persist_error(human_log_path))?;

    let mut writer = BufWriter::new(numeric_table);
    write_numeric_table(dataset, &mut writer).map_err(persist_error(numeric_table_path))?;
    writer.flush().map_err(persist_error(numeric_table_path))?;

    info!(
        entries = dataset.len(),
        human_log = %human_log_path.display(),
        numeric_table = %numeric_table_path.display(),
        "dataset persisted"
    );
    Ok(())
}

/// Write the JSON export to `path`, replacing any previous file.
pub fn persist_json(dataset: &Dataset, path: &Path) -> Result<(), RunnerError> {
    let file = File::create(path).map_err(persist_error(path))?;
    let mut writer = BufWriter::new(file);
    export_json(dataset, &mut writer).map_err(persist_error(path))?;
    writer.flush().map_err(persist_error(path))?;

    info!(entries = dataset.len(), path = %path.display(), "dataset exported as JSON");
    Ok(())
}
