//! Quantities derived from sweep rows.
//!
//! A transmission measurement is taken twice: once through the sample and once
//! through an empty path. Dividing magnitudes and subtracting phases removes
//! the response of the source, optics and detector.

use crate::sweep::SweepResult;
use mmw_core::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Swept values closer than this are the same point.
const VALUE_TOLERANCE: f64 = 1e-9;

/// Magnitude and phase at one swept value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Swept value.
    pub value: f64,
    /// `√(x² + y²)`, or a ratio of two after [`subtract_reference`].
    pub magnitude: f64,
    /// Phase in degrees, or a difference of two after [`subtract_reference`].
    pub phase_deg: f64,
}

/// Magnitude and phase of every row.
pub fn response(result: &SweepResult) -> Vec<Response> {
    result
        .rows
        .iter()
        .map(|row| Response {
            value: row.value,
            magnitude: row.magnitude(),
            phase_deg: row.phase_degrees(),
        })
        .collect()
}

/// Normalize `sample` against `reference`, point by point.
///
/// The magnitude is `|sample| / |reference|` and the phase is
/// `phase(sample) - phase(reference)` wrapped into (-180, 180].
///
/// # Errors
///
/// `DaqError::InvalidParameter` when the two sweeps differ in length or in any
/// swept value.
pub fn subtract_reference(sample: &SweepResult, reference: &SweepResult) -> AppResult<Vec<Response>> {
    if sample.len() != reference.len() {
        return Err(DaqError::InvalidParameter(format!(
            "sample has {} points, reference has {}",
            sample.len(),
            reference.len()
        )));
    }

    sample
        .rows
        .iter()
        .zip(&reference.rows)
        .enumerate()
        .map(|(i, (s, r))| {
            if (s.value - r.value).abs() > VALUE_TOLERANCE {
                return Err(DaqError::InvalidParameter(format!(
                    "point {}: sample value {} does not match reference value {}",
                    i, s.value, r.value
                )));
            }
            Ok(Response {
                value: s.value,
                magnitude: s.magnitude() / r.magnitude(),
                phase_deg: wrap_degrees(s.phase_degrees() - r.phase_degrees()),
            })
        })
        .collect()
}

fn wrap_degrees(deg: f64) -> f64 {
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 {
        180.0
    } else {
        wrapped
    }
}
