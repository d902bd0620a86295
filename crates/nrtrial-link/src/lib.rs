//! # nrtrial-link
//!
//! Link-quality metric derivation for the NR trial harvester.
//!
//! This crate turns raw physical quantities reported by the simulator into
//! dataset metrics:
//! - Spectral efficiency from linear SINR ([`spectral_efficiency`])
//! - Channel value from RSSI ([`channel_value`])
//! - Normalized spectral efficiency ([`normalize_spectral_efficiency`])
//! - The exogenous user priority draw ([`draw_user_priority`])
//!
//! ## Calibration
//!
//! The normalization constants encode the assumed operating ranges of the
//! simulator: RSSI in roughly -120..+10 dBm and spectral efficiency in
//! roughly 0..10 bps/Hz. They are fixed and never fitted to data. Results are
//! not clamped, so telemetry outside those ranges maps outside [0, 1].

use nrtrial_common::{NormalizedRecord, TrialRecord, TrialTelemetry};
use rand::Rng;
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Offset added to RSSI (dBm) so the bottom of the calibration range maps to 0.
pub const RSSI_OFFSET_DB: f64 = 120.0;

/// Width of the RSSI calibration range, dB.
pub const RSSI_SPAN_DB: f64 = 130.0;

/// Spectral efficiency mapped to 1.0, bps/Hz.
pub const SPECTRAL_EFFICIENCY_MAX_BPS_HZ: f64 = 10.0;

// ============================================================================
// Error Types
// ============================================================================

/// Errors from metric derivation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    /// SINR below zero; the simulator never reports a negative linear ratio.
    #[error("negative linear SINR: {0}")]
    NegativeSinr(f64),

    /// SINR that is NaN or infinite.
    #[error("non-finite linear SINR: {0}")]
    NonFiniteSinr(f64),
}

// ============================================================================
// Metric Derivation
// ============================================================================

/// Shannon estimate of spectral efficiency, `log2(1 + sinr)`, in bps/Hz.
///
/// This ignores the MCS ceiling of a real scheduler and is an upper bound,
/// not what the link would actually carry.
pub fn spectral_efficiency(sinr_linear: f64) -> Result<f64, LinkError> {
    if !sinr_linear.is_finite() {
        return Err(LinkError::NonFiniteSinr(sinr_linear));
    }
    if sinr_linear < 0.0 {
        return Err(LinkError::NegativeSinr(sinr_linear));
    }
    Ok((1.0 + sinr_linear).log2())
}

/// Draw a user priority uniformly from [0, 1).
///
/// The caller owns the random source; seed it for reproducible datasets.
pub fn draw_user_priority<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen::<f64>()
}

/// Channel value (CV): `(rssi + 120) / 130`, unclamped.
pub fn channel_value(rssi_dbm: f64) -> f64 {
    (rssi_dbm + RSSI_OFFSET_DB) / RSSI_SPAN_DB
}

/// Normalized spectral efficiency: `se / 10`, unclamped.
pub fn normalize_spectral_efficiency(spectral_efficiency_bps_hz: f64) -> f64 {
    spectral_efficiency_bps_hz / SPECTRAL_EFFICIENCY_MAX_BPS_HZ
}

/// Build the raw record for a trial.
///
/// Telemetry the simulator never reported defaults to 0.0; a missing
/// position stays absent.
pub fn trial_record(telemetry: &TrialTelemetry, user_priority: f64) -> TrialRecord {
    TrialRecord {
        rssi_dbm: telemetry.rssi_dbm.unwrap_or(0.0),
        spectral_efficiency_bps_hz: telemetry.spectral_efficiency_bps_hz.unwrap_or(0.0),
        position: telemetry.position,
        user_priority,
    }
}

/// Map a raw record into dataset units.
pub fn normalize(record: &TrialRecord) -> NormalizedRecord {
    NormalizedRecord {
        channel_value: channel_value(record.rssi_dbm),
        user_priority: record.user_priority,
        spectral_efficiency_norm: normalize_spectral_efficiency(record.spectral_efficiency_bps_hz),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_spectral_efficiency_zero_and_monotonic() {
        assert_eq!(spectral_efficiency(0.0).unwrap(), 0.0);
        assert!((spectral_efficiency(1.0).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!((spectral_efficiency(3.0).unwrap() - 2.0).abs() < f64::EPSILON);

        let mut last = 0.0;
        for i in 0..1000 {
            let se = spectral_efficiency(i as f64 * 0.37).unwrap();
            assert!(se >= last, "SE must not decrease: {} < {}", se, last);
            last = se;
        }
        assert!(spectral_efficiency(1e-9).unwrap() > 0.0);
    }

    #[test]
    fn test_spectral_efficiency_rejects_bad_input() {
        assert_eq!(spectral_efficiency(-0.5), Err(LinkError::NegativeSinr(-0.5)));
        assert!(matches!(
            spectral_efficiency(f64::NAN),
            Err(LinkError::NonFiniteSinr(_))
        ));
        assert!(matches!(
            spectral_efficiency(f64::INFINITY),
            Err(LinkError::NonFiniteSinr(_))
        ));
    }

    #[test]
    fn test_channel_value_calibration_bounds() {
        assert!((channel_value(-120.0) - 0.0).abs() < 1e-12);
        assert!((channel_value(10.0) - 1.0).abs() < 1e-12);
        // Outside the calibration range values are kept as-is
        assert!(channel_value(-130.0) < 0.0);
        assert!(channel_value(20.0) > 1.0);
    }

    #[test]
    fn test_normalize_spectral_efficiency_unclamped() {
        assert!((normalize_spectral_efficiency(4.0) - 0.4).abs() < 1e-12);
        assert!((normalize_spectral_efficiency(12.0) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_user_priority_range_and_seeding() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..1000 {
            let up = draw_user_priority(&mut rng);
            assert!((0.0..1.0).contains(&up), "priority out of range: {}", up);
        }

        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(draw_user_priority(&mut a), draw_user_priority(&mut b));
    }

    #[test]
    fn test_trial_record_defaults_and_normalize() {
        let telemetry = TrialTelemetry {
            rssi_dbm: Some(-95.0),
            spectral_efficiency_bps_hz: Some(4.0),
            ..TrialTelemetry::default()
        };
        let record = trial_record(&telemetry, 0.25);
        let normalized = normalize(&record);
        assert!((normalized.channel_value - 25.0 / 130.0).abs() < 1e-12);
        assert!((normalized.spectral_efficiency_norm - 0.4).abs() < 1e-12);
        assert_eq!(normalized.user_priority, 0.25);

        let empty = trial_record(&TrialTelemetry::new(), 0.5);
        assert_eq!(empty.rssi_dbm, 0.0);
        assert_eq!(empty.spectral_efficiency_bps_hz, 0.0);
        assert!(empty.position.is_none());
        assert!((normalize(&empty).channel_value - 120.0 / 130.0).abs() < 1e-12);
    }
}
