//! Per-device calibration curves.
//!
//! A device carries at most one curve per quantity (gravity, temperature).
//! Tilt-class devices use a piecewise-linear table of `(raw, actual)`
//! points; iSpindel-class devices use a polynomial evaluated in the raw
//! domain. Curves are stored on the device row as JSON.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A calibration curve mapping raw readings to actual values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationCurve {
    /// Piecewise-linear interpolation over `(raw, actual)` points.
    ///
    /// Raw values must be strictly increasing. Outside the table the end
    /// segments are extended linearly.
    Linear {
        /// Calibration points as `(raw, actual)` pairs.
        points: Vec<(f64, f64)>,
    },
    /// Polynomial in the raw domain, coefficients in ascending power order.
    Polynomial {
        /// `c0 + c1*x + c2*x^2 + ...`
        coefficients: Vec<f64>,
    },
}

impl CalibrationCurve {
    /// Validate the curve's structural invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCalibration`] if a linear curve is empty or
    /// has non-increasing raw values, or a polynomial has no coefficients or
    /// a non-finite entry.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Linear { points } => {
                if points.is_empty() {
                    return Err(Error::InvalidCalibration {
                        reason: "linear curve has no points".to_string(),
                    });
                }
                for pair in points.windows(2) {
                    if pair[1].0 <= pair[0].0 {
                        return Err(Error::InvalidCalibration {
                            reason: format!(
                                "raw values must be strictly increasing ({} then {})",
                                pair[0].0, pair[1].0
                            ),
                        });
                    }
                }
                if points.iter().any(|(r, a)| !r.is_finite() || !a.is_finite()) {
                    return Err(Error::InvalidCalibration {
                        reason: "non-finite calibration point".to_string(),
                    });
                }
                Ok(())
            }
            Self::Polynomial { coefficients } => {
                if coefficients.is_empty() {
                    return Err(Error::InvalidCalibration {
                        reason: "polynomial has no coefficients".to_string(),
                    });
                }
                if coefficients.iter().any(|c| !c.is_finite()) {
                    return Err(Error::InvalidCalibration {
                        reason: "non-finite polynomial coefficient".to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Apply the curve to a raw value.
    pub fn apply(&self, raw: f64) -> f64 {
        match self {
            Self::Linear { points } => Self::interpolate(points, raw),
            Self::Polynomial { coefficients } => {
                // Horner evaluation, highest power first.
                coefficients
                    .iter()
                    .rev()
                    .fold(0.0, |acc, c| acc * raw + c)
            }
        }
    }

    fn interpolate(points: &[(f64, f64)], raw: f64) -> f64 {
        match points {
            [] => raw,
            [(r, a)] => raw + (a - r),
            _ => {
                // Pick the segment containing raw, or the nearest end
                // segment for extrapolation.
                let last = points.len() - 2;
                let idx = points
                    .windows(2)
                    .position(|pair| raw <= pair[1].0)
                    .unwrap_or(last);
                let (r0, a0) = points[idx];
                let (r1, a1) = points[idx + 1];
                let slope = (a1 - a0) / (r1 - r0);
                a0 + (raw - r0) * slope
            }
        }
    }

    /// Parse a curve from its persisted JSON form and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is not a curve or the curve is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        let curve: Self = serde_json::from_str(json)?;
        curve.validate()?;
        Ok(curve)
    }

    /// Serialize the curve to its persisted JSON form.
    pub fn to_json(&self) -> String {
        // A validated curve always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identity_points_are_identity() {
        let curve = CalibrationCurve::Linear {
            points: vec![(1.000, 1.000), (1.050, 1.050), (1.100, 1.100)],
        };
        curve.validate().unwrap();
        for raw in [0.990, 1.000, 1.025, 1.050, 1.080, 1.100, 1.115] {
            assert!((curve.apply(raw) - raw).abs() < 1e-12);
        }
    }

    #[test]
    fn test_linear_interpolation_between_points() {
        let curve = CalibrationCurve::Linear {
            points: vec![(1.000, 1.002), (1.060, 1.058)],
        };
        // Midpoint of the segment maps to the midpoint of the actuals.
        let mid = curve.apply(1.030);
        assert!((mid - 1.030).abs() < 1e-9);
    }

    #[test]
    fn test_linear_extrapolates_end_segments() {
        let curve = CalibrationCurve::Linear {
            points: vec![(10.0, 20.0), (20.0, 40.0)],
        };
        assert!((curve.apply(30.0) - 60.0).abs() < 1e-9);
        assert!((curve.apply(0.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_point_offset() {
        let curve = CalibrationCurve::Linear {
            points: vec![(1.050, 1.053)],
        };
        assert!((curve.apply(1.040) - 1.043).abs() < 1e-9);
    }

    #[test]
    fn test_polynomial_horner() {
        // 2 + 3x + x^2
        let curve = CalibrationCurve::Polynomial {
            coefficients: vec![2.0, 3.0, 1.0],
        };
        curve.validate().unwrap();
        assert!((curve.apply(0.0) - 2.0).abs() < 1e-12);
        assert!((curve.apply(2.0) - 12.0).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_unsorted() {
        let curve = CalibrationCurve::Linear {
            points: vec![(1.050, 1.050), (1.000, 1.000)],
        };
        assert!(curve.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nan_coefficient() {
        let curve = CalibrationCurve::Polynomial {
            coefficients: vec![1.0, f64::NAN],
        };
        assert!(curve.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let curve = CalibrationCurve::Linear {
            points: vec![(1.000, 1.001), (1.050, 1.049)],
        };
        let back = CalibrationCurve::from_json(&curve.to_json()).unwrap();
        assert_eq!(curve, back);
    }
}
