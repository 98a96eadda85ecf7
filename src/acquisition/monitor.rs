//! Continuous power monitoring.
//!
//! Samples the reference device back-to-back for a requested duration. The
//! sample count is fixed up front from the device's cycle time; a timeout ends
//! the run early and the series keeps only the samples that succeeded.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use super::poll::Deadline;
use super::{configuration_of, cycle_time, sample_scalar, AcquisitionContext, SampleOutcome, POWER_FIELD};
use crate::data::{AcquisitionPhase, PowerSeries, TimeSeries, TimeoutEvent};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DeviceProxy;
use crate::hardware::config_f64;
use crate::metadata::MetadataBuilder;

/// Upper bound on the series storage reserved before a run starts.
const MAX_PREALLOCATED_SAMPLES: usize = 4096;

/// Parameters of one monitoring run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorRequest {
    /// How long to keep sampling
    pub duration: Duration,
    /// Device readings per sample, multiplies the cycle time
    pub samples_per_point: usize,
    /// Dataset name; defaults to `power-reading_<start time>`
    pub name: Option<String>,
}

impl MonitorRequest {
    /// Run for `duration` with 5 readings per sample and the default name.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            samples_per_point: 5,
            name: None,
        }
    }

    /// Set the device readings per sample.
    pub fn with_samples_per_point(mut self, samples_per_point: usize) -> Self {
        self.samples_per_point = samples_per_point;
        self
    }

    /// Set the dataset name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Number of sample slots for a run: `ceil(duration / cycle) + 1`.
pub fn expected_samples(duration: Duration, cycle: Duration) -> usize {
    let slots = duration.as_nanos().div_ceil(cycle.as_nanos().max(1));
    usize::try_from(slots).unwrap_or(usize::MAX).saturating_add(1)
}

/// Sample `meter` for `request.duration`.
#[instrument(skip_all, fields(device = meter.name(), duration = ?request.duration))]
pub async fn monitor_power(
    ctx: &AcquisitionContext<'_>,
    meter: &dyn DeviceProxy,
    request: &MonitorRequest,
) -> AppResult<PowerSeries> {
    if request.duration.is_zero() {
        return Err(DaqError::Configuration(
            "monitoring duration must be positive".to_string(),
        ));
    }
    let config = configuration_of(meter).await?;
    let cycle = cycle_time(&config, ctx.timing.sample_period, request.samples_per_point)?;
    let deadline = Deadline::Within(cycle.mul_f64(ctx.timing.monitor_timeout_cycles));
    let capacity = expected_samples(request.duration, cycle);

    let started_at = Utc::now();
    let name = request
        .name
        .clone()
        .unwrap_or_else(|| format!("power-reading_{}", started_at.format("%Y-%m-%d_%H-%M-%S")));
    info!(%name, ?cycle, capacity, "Monitoring power");

    let mut series = TimeSeries::with_capacity(capacity.min(MAX_PREALLOCATED_SAMPLES));
    let mut timeouts = Vec::new();
    let started = Instant::now();
    for slot in 0..capacity {
        let elapsed = started.elapsed();
        match sample_scalar(ctx.waiter, meter, POWER_FIELD, deadline).await? {
            SampleOutcome::Sample(power) => series.push(elapsed, power),
            SampleOutcome::TimedOut { waited } => {
                warn!(
                    device = meter.name(),
                    slot,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    waited_ms = waited.as_millis() as u64,
                    "Power meter timed out, stopping the monitor with {} samples",
                    series.len()
                );
                timeouts.push(TimeoutEvent {
                    device: meter.name().to_string(),
                    phase: AcquisitionPhase::Monitoring,
                    setpoint: None,
                    elapsed_s: started.elapsed().as_secs_f64(),
                });
                break;
            }
        }
    }

    let metadata = MetadataBuilder::new(name, started_at)
        .instrument(meter.name(), config.clone())
        .parameter("duration_s", request.duration.as_secs_f64())
        .parameter("samples_per_point", request.samples_per_point)
        .parameter("cycle_time_s", cycle.as_secs_f64())
        .parameter("averaging", config_f64(&config, "averaging")?)
        .build();

    Ok(PowerSeries {
        metadata,
        series,
        timeouts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::poll::Poller;
    use crate::config::TimingConfig;
    use crate::hardware::mock::MockPowerMeter;
    use crate::operator::AutoConfirm;
    use tracing_test::traced_test;

    fn timing() -> TimingConfig {
        TimingConfig::default().without_settle_delays()
    }

    #[test]
    fn test_expected_samples() {
        let cycle = Duration::from_millis(50);
        assert_eq!(expected_samples(Duration::from_secs(1), cycle), 21);
        assert_eq!(expected_samples(Duration::from_millis(1010), cycle), 22);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_run_has_expected_length() {
        let timing = timing();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let meter = MockPowerMeter::new(1.0e-3);

        let result = monitor_power(&ctx, &meter, &MonitorRequest::new(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(result.series.len(), 21);
        assert!(result.timeouts.is_empty());
        assert_eq!(result.series.times[0], 0.0);
        assert!(result.series.times.windows(2).all(|w| w[0] < w[1]));
        assert!(result.metadata.name.starts_with("power-reading_"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_timeout_truncates_without_padding() {
        let timing = timing();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };

        for k in [0usize, 1, 7] {
            let meter = MockPowerMeter::new(1.0e-3).hang_after(k);
            let result = monitor_power(&ctx, &meter, &MonitorRequest::new(Duration::from_secs(1)))
                .await
                .unwrap();
            assert_eq!(result.series.len(), k);
            assert_eq!(result.series.times.len(), k);
            assert_eq!(result.timeouts.len(), 1);
        }
        assert!(logs_contain("Power meter timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_run_reserves_bounded_storage() {
        let timing = timing();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        // Thirty days of slots, cut short after two samples.
        let meter = MockPowerMeter::new(1.0e-3).hang_after(2);
        let request = MonitorRequest::new(Duration::from_secs(30 * 24 * 3600));

        let result = monitor_power(&ctx, &meter, &request).await.unwrap();

        assert_eq!(result.series.len(), 2);
        assert!(result.series.values.capacity() <= MAX_PREALLOCATED_SAMPLES);
        assert!(result.series.times.capacity() <= MAX_PREALLOCATED_SAMPLES);
    }

    #[test]
    fn test_expected_samples_saturates() {
        assert_eq!(expected_samples(Duration::MAX, Duration::from_nanos(1)), usize::MAX);
    }

    #[tokio::test]
    async fn test_zero_duration_rejected() {
        let timing = timing();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let meter = MockPowerMeter::new(1.0e-3);
        let result = monitor_power(&ctx, &meter, &MonitorRequest::new(Duration::ZERO)).await;
        assert!(matches!(result, Err(DaqError::Configuration(_))));
        assert_eq!(meter.trigger_count(), 0);
    }
}
