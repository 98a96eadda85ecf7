//! Scan plans: which setpoints a sweep visits.
//!
//! A plan is built once per acquisition call, validated against the tunable
//! device's range before anything moves, then consumed by iteration.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError, RangeBound};

/// Guard against plans that would never finish (e.g. a step of 1e-12 nm).
pub const MAX_SETPOINTS: usize = 100_000;

/// Relative slack when deciding whether the far endpoint is on the step grid.
const GRID_EPSILON: f64 = 1e-9;

/// `{start, stop, step}` sweep description.
///
/// The endpoints may be given in either order; setpoints are always generated in
/// ascending order, and the far endpoint is included when it lies on the step grid.
///
/// # Example
///
/// ```rust
/// use ple_daq::acquisition::plan::ScanPlan;
///
/// let plan = ScanPlan::new(500.0, 450.0, 10.0)?;
/// assert_eq!(plan.setpoints(), vec![450.0, 460.0, 470.0, 480.0, 490.0, 500.0]);
/// # Ok::<(), ple_daq::error::DaqError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// First endpoint as given by the caller
    pub start: f64,
    /// Second endpoint as given by the caller
    pub stop: f64,
    /// Increment between setpoints
    pub step: f64,
}

impl ScanPlan {
    /// Build a plan, rejecting degenerate input.
    pub fn new(start: f64, stop: f64, step: f64) -> AppResult<Self> {
        if !start.is_finite() || !stop.is_finite() {
            return Err(DaqError::InvalidScan(format!(
                "endpoints must be finite (start={start}, stop={stop})"
            )));
        }
        if start == stop {
            return Err(DaqError::InvalidScan(format!(
                "start and stop must differ (both {start})"
            )));
        }
        if !(step > 0.0 && step.is_finite()) {
            return Err(DaqError::InvalidScan(format!(
                "step must be positive, got {step}"
            )));
        }
        let plan = Self { start, stop, step };
        // Checked in floating point, before any integer conversion.
        let span = plan.span();
        if !span.is_finite() || span >= MAX_SETPOINTS as f64 {
            return Err(DaqError::InvalidScan(format!(
                "plan would visit more than {MAX_SETPOINTS} setpoints"
            )));
        }
        Ok(plan)
    }

    /// Lower endpoint after normalization.
    pub fn lower(&self) -> f64 {
        self.start.min(self.stop)
    }

    /// Upper endpoint after normalization.
    pub fn upper(&self) -> f64 {
        self.start.max(self.stop)
    }

    /// Distance between the endpoints in steps.
    fn span(&self) -> f64 {
        (self.upper() - self.lower()) / self.step
    }

    /// Number of setpoints the plan generates.
    pub fn point_count(&self) -> usize {
        let span = self.span();
        (span + GRID_EPSILON * span.max(1.0))
            .floor()
            .min(MAX_SETPOINTS as f64) as usize
            + 1
    }

    /// Ascending setpoints.
    pub fn setpoints(&self) -> Vec<f64> {
        let lower = self.lower();
        (0..self.point_count())
            .map(|i| lower + i as f64 * self.step)
            .collect()
    }
}

/// Reachable range of the tunable device, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralRange {
    /// Lowest reachable setpoint
    pub min: f64,
    /// Highest reachable setpoint
    pub max: f64,
}

impl SpectralRange {
    /// Range from its two bounds.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// `true` if `value` is reachable.
    pub fn contains(&self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Check every setpoint; the first violation is reported with the bound it broke.
    pub fn check(&self, setpoints: &[f64]) -> AppResult<()> {
        for &setpoint in setpoints {
            if setpoint < self.min {
                return Err(DaqError::ScanOutOfRange {
                    setpoint,
                    bound: RangeBound::Lower,
                    limit: self.min,
                });
            }
            if setpoint > self.max {
                return Err(DaqError::ScanOutOfRange {
                    setpoint,
                    bound: RangeBound::Upper,
                    limit: self.max,
                });
            }
        }
        Ok(())
    }
}

/// Generate the plan's setpoints and fail fast if any is unreachable.
pub fn validated_setpoints(plan: &ScanPlan, range: &SpectralRange) -> AppResult<Vec<f64>> {
    let setpoints = plan.setpoints();
    range.check(&setpoints)?;
    Ok(setpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversed_endpoints_generate_same_sequence() {
        for (a, b, step) in [(500.0, 450.0, 10.0), (700.0, 420.0, 7.5), (3.0, 1.0, 0.5)] {
            let forward = ScanPlan::new(b, a, step).unwrap().setpoints();
            let reversed = ScanPlan::new(a, b, step).unwrap().setpoints();
            assert_eq!(forward, reversed);
            assert!(forward.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_endpoint_included_on_grid() {
        let plan = ScanPlan::new(450.0, 500.0, 10.0).unwrap();
        assert_eq!(plan.point_count(), 6);
        assert_eq!(plan.setpoints().last(), Some(&500.0));
    }

    #[test]
    fn test_endpoint_excluded_off_grid() {
        let plan = ScanPlan::new(450.0, 505.0, 10.0).unwrap();
        assert_eq!(plan.setpoints(), vec![450.0, 460.0, 470.0, 480.0, 490.0, 500.0]);
    }

    #[test]
    fn test_fractional_step_does_not_drop_last_point() {
        let plan = ScanPlan::new(0.0, 0.3, 0.1).unwrap();
        assert_eq!(plan.point_count(), 4);
    }

    #[test]
    fn test_step_larger_than_span() {
        let plan = ScanPlan::new(450.0, 455.0, 10.0).unwrap();
        assert_eq!(plan.setpoints(), vec![450.0]);
    }

    #[test]
    fn test_degenerate_plans_rejected() {
        assert!(matches!(ScanPlan::new(500.0, 500.0, 10.0), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(450.0, 500.0, 0.0), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(450.0, 500.0, -5.0), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(f64::NAN, 500.0, 1.0), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(0.0, 1.0, 1e-9), Err(DaqError::InvalidScan(_))));
        // Finite endpoints whose distance overflows f64.
        assert!(matches!(ScanPlan::new(-1e308, 1e308, 1.0), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(0.0, 1e300, 1e-300), Err(DaqError::InvalidScan(_))));
        assert!(matches!(ScanPlan::new(0.0, 100_000.0, 1.0), Err(DaqError::InvalidScan(_))));
        assert_eq!(ScanPlan::new(0.0, 99_999.0, 1.0).unwrap().point_count(), MAX_SETPOINTS);
    }

    #[test]
    fn test_range_check_reports_violated_bound() {
        let setpoints = ScanPlan::new(500.0, 450.0, 10.0).unwrap().setpoints();

        assert!(SpectralRange::new(420.0, 700.0).check(&setpoints).is_ok());

        match SpectralRange::new(500.0, 700.0).check(&setpoints) {
            Err(DaqError::ScanOutOfRange { setpoint, bound, limit }) => {
                assert_eq!(setpoint, 450.0);
                assert_eq!(bound, RangeBound::Lower);
                assert_eq!(limit, 500.0);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(matches!(
            SpectralRange::new(420.0, 480.0).check(&setpoints),
            Err(DaqError::ScanOutOfRange { bound: RangeBound::Upper, .. })
        ));
    }
}
