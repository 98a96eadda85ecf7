//! Datasets produced by the acquisition routines.
//!
//! Each routine accumulates samples locally and returns one of the types below;
//! the [`storage`] sinks turn them into files. All datasets carry
//! [`DatasetMetadata`] so they are self-describing once on disk.

pub mod storage;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::hardware::Frame;
use crate::metadata::DatasetMetadata;

/// Mean and population standard deviation of the reference samples taken at one setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    /// Mean of the samples
    pub mean: f64,
    /// Population standard deviation
    pub std_dev: f64,
    /// Number of samples reduced, always at least one
    pub samples: usize,
}

impl AggregatedPoint {
    /// Reduce samples to a point. `None` when there is nothing to reduce.
    pub fn reduce(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: variance.sqrt(),
            samples: values.len(),
        })
    }
}

/// Where in an acquisition a device timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionPhase {
    /// Baseline taken with the excitation blocked
    DarkReference,
    /// Continuous sampling
    Monitoring,
    /// Stepping through setpoints
    Sweep,
}

/// Record of a device timeout that was handled by degrading, kept with the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    /// Name of the device that timed out
    pub device: String,
    /// What the routine was doing
    pub phase: AcquisitionPhase,
    /// Setpoint being acquired, if the routine sweeps
    pub setpoint: Option<f64>,
    /// Seconds since the start of the acquisition
    pub elapsed_s: f64,
}

/// Ordered `(elapsed, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Seconds since the series' reference instant
    pub times: Vec<f64>,
    /// Sample values, same length as `times`
    pub values: Vec<f64>,
}

impl TimeSeries {
    /// Empty series with room for `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            times: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    /// Append a sample taken `elapsed` after the reference instant.
    pub fn push(&mut self, elapsed: Duration, value: f64) {
        self.times.push(elapsed.as_secs_f64());
        self.values.push(value);
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` without samples.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Output of the continuous sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSeries {
    /// Provenance
    pub metadata: DatasetMetadata,
    /// One entry per successful sample; never padded
    pub series: TimeSeries,
    /// Timeout that ended the run early, if any
    pub timeouts: Vec<TimeoutEvent>,
}

/// Output of the swept scalar acquisition.
///
/// `setpoints` and `points` always have the same length: a sweep cut short by a
/// timeout holds only the setpoints completed before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningCurve {
    /// Provenance
    pub metadata: DatasetMetadata,
    /// Baseline measured with the beam blocked
    pub dark_reference: AggregatedPoint,
    /// Completed setpoints, in sweep order
    pub setpoints: Vec<f64>,
    /// One point per completed setpoint
    pub points: Vec<AggregatedPoint>,
    /// Timeout that truncated the sweep, if any
    pub timeouts: Vec<TimeoutEvent>,
}

impl TuningCurve {
    /// `true` when the sweep stopped before its last planned setpoint.
    pub fn truncated(&self) -> bool {
        !self.timeouts.is_empty()
    }
}

/// Image per setpoint from the gated acquisition, plus the dark frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCube {
    /// Provenance
    pub metadata: DatasetMetadata,
    /// Setpoints in acquisition order
    pub setpoints: Vec<f64>,
    /// One frame per setpoint, same order as `setpoints`
    pub frames: Vec<Frame>,
    /// Frame taken with the excitation blocked
    pub dark_frame: Frame,
}

/// Reference samples taken while each exposure was in progress.
///
/// Rows are padded with `None` to `max_observed_length`, giving a rectangular
/// table; `valid_counts[i]` is the number of real samples in row `i`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerTrace {
    /// Provenance; shares the run id of the image cube
    pub metadata: DatasetMetadata,
    /// Setpoints in acquisition order
    pub setpoints: Vec<f64>,
    /// Width of every row
    pub max_observed_length: usize,
    /// Real samples per row
    pub valid_counts: Vec<usize>,
    /// Seconds since the exposure trigger
    pub times: Vec<Vec<Option<f64>>>,
    /// Reference values, padded like `times`
    pub power: Vec<Vec<Option<f64>>>,
    /// Reference reading during the dark frame, absent if it timed out
    pub dark_power: Option<f64>,
    /// Timeouts the scan degraded around
    pub timeouts: Vec<TimeoutEvent>,
}

impl PowerTrace {
    /// Build the rectangular table from one ragged series per setpoint.
    pub fn from_series(
        metadata: DatasetMetadata,
        setpoints: Vec<f64>,
        series: Vec<TimeSeries>,
        dark_power: Option<f64>,
        timeouts: Vec<TimeoutEvent>,
    ) -> Self {
        let max_observed_length = series.iter().map(TimeSeries::len).max().unwrap_or(0);
        let valid_counts = series.iter().map(TimeSeries::len).collect();
        let pad = |values: &[f64]| -> Vec<Option<f64>> {
            let mut row: Vec<Option<f64>> = values
                .iter()
                .take(max_observed_length)
                .copied()
                .map(Some)
                .collect();
            row.resize(max_observed_length, None);
            row
        };
        let times = series.iter().map(|s| pad(&s.times)).collect();
        let power = series.iter().map(|s| pad(&s.values)).collect();
        Self {
            metadata,
            setpoints,
            max_observed_length,
            valid_counts,
            times,
            power,
            dark_power,
            timeouts,
        }
    }
}

/// Borrowed view of any dataset a routine can hand to persistence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionResult<'a> {
    /// Continuous monitor output
    PowerSeries(&'a PowerSeries),
    /// Swept scalar acquisition output
    TuningCurve(&'a TuningCurve),
    /// Images of the gated acquisition
    ImageCube(&'a ImageCube),
    /// Reference samples of the gated acquisition
    PowerTrace(&'a PowerTrace),
}

impl<'a> AcquisitionResult<'a> {
    /// Metadata of the underlying dataset.
    pub fn metadata(&self) -> &'a DatasetMetadata {
        match *self {
            AcquisitionResult::PowerSeries(d) => &d.metadata,
            AcquisitionResult::TuningCurve(d) => &d.metadata,
            AcquisitionResult::ImageCube(d) => &d.metadata,
            AcquisitionResult::PowerTrace(d) => &d.metadata,
        }
    }

    /// Timeouts the routine degraded around; image cubes carry none.
    pub fn timeouts(&self) -> &'a [TimeoutEvent] {
        match *self {
            AcquisitionResult::PowerSeries(d) => &d.timeouts,
            AcquisitionResult::TuningCurve(d) => &d.timeouts,
            AcquisitionResult::ImageCube(_) => &[],
            AcquisitionResult::PowerTrace(d) => &d.timeouts,
        }
    }

    /// Short label used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionResult::PowerSeries(_) => "power_series",
            AcquisitionResult::TuningCurve(_) => "tuning_curve",
            AcquisitionResult::ImageCube(_) => "image_cube",
            AcquisitionResult::PowerTrace(_) => "power_trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataBuilder;

    #[test]
    fn test_reduce_population_std() {
        let point = AggregatedPoint::reduce(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(point.mean, 5.0);
        assert_eq!(point.std_dev, 2.0);
        assert_eq!(point.samples, 8);
    }

    #[test]
    fn test_reduce_single_and_empty() {
        let point = AggregatedPoint::reduce(&[3.5]).unwrap();
        assert_eq!((point.mean, point.std_dev), (3.5, 0.0));
        assert!(AggregatedPoint::reduce(&[]).is_none());
    }

    #[test]
    fn test_power_trace_is_rectangular() {
        let mut long = TimeSeries::default();
        for i in 0..3 {
            long.push(Duration::from_millis(10 * i), i as f64);
        }
        let mut short = TimeSeries::default();
        short.push(Duration::from_millis(5), 7.0);

        let trace = PowerTrace::from_series(
            MetadataBuilder::new("trace", chrono::Utc::now()).build(),
            vec![450.0, 460.0, 470.0],
            vec![long, short, TimeSeries::default()],
            None,
            Vec::new(),
        );

        assert_eq!(trace.max_observed_length, 3);
        assert_eq!(trace.valid_counts, vec![3, 1, 0]);
        assert!(trace.power.iter().all(|row| row.len() == 3));
        assert_eq!(trace.power[1], vec![Some(7.0), None, None]);
        assert_eq!(trace.times[0][2], Some(0.02));
    }
}
