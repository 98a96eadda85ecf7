//! Acquisition scheduler.
//!
//! Every routine here is built from the same small steps: trigger a device,
//! wait for it through a [`ReadinessWaiter`], fetch what it measured. Timeouts
//! come back as [`SampleOutcome::TimedOut`] values and each routine decides
//! locally how to degrade; only failures of the proxies themselves are errors.
//!
//! - [`monitor`]: power meter sampled at a fixed cadence for a duration
//! - [`tuning_curve`]: mean reference power per setpoint of the source
//! - [`excitation`]: one image per setpoint, with the reference sampled during each exposure
//! - [`dark`]: baseline readings taken before a sweep

pub mod dark;
pub mod excitation;
pub mod monitor;
pub mod plan;
pub mod poll;
pub mod tuning_curve;

use std::time::Duration;

use crate::config::TimingConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::DeviceProxy;
use crate::hardware::{config_f64, DeviceConfig};
use crate::operator::OperatorGate;
use poll::{Deadline, PollOutcome, ReadinessWaiter};

/// Reading field holding the reference device's scalar.
pub const POWER_FIELD: &str = "power";
/// Reading field holding the camera frame.
pub const IMAGE_FIELD: &str = "image";

/// Collaborators shared by every routine of one acquisition call.
#[derive(Clone, Copy)]
pub struct AcquisitionContext<'a> {
    /// Poll-until-ready strategy
    pub waiter: &'a dyn ReadinessWaiter,
    /// Human-action prompts
    pub gate: &'a dyn OperatorGate,
    /// Settle delays and deadline factors
    pub timing: &'a TimingConfig,
}

/// Result of one trigger/wait/fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// The device answered with this value
    Sample(f64),
    /// The deadline passed with the device still busy
    TimedOut {
        /// Time spent waiting
        waited: Duration,
    },
}

/// Time for `samples_per_point` readings of a device configured with `averaging`.
///
/// `averaging x sample_period x samples_per_point`.
pub fn cycle_time(
    config: &DeviceConfig,
    sample_period: Duration,
    samples_per_point: usize,
) -> AppResult<Duration> {
    let averaging = config_f64(config, "averaging")?;
    if !(averaging > 0.0 && averaging.is_finite()) {
        return Err(DaqError::Configuration(format!(
            "reference device averaging must be positive, got {averaging}"
        )));
    }
    if samples_per_point == 0 {
        return Err(DaqError::Configuration(
            "samples per point must be at least 1".to_string(),
        ));
    }
    Ok(sample_period.mul_f64(averaging * samples_per_point as f64))
}

/// Trigger `device`, wait up to `deadline`, and fetch the scalar `field`.
///
/// A timed-out device is left as is: nothing is fetched and nothing is sent.
pub async fn sample_scalar(
    waiter: &dyn ReadinessWaiter,
    device: &dyn DeviceProxy,
    field: &str,
    deadline: Deadline,
) -> AppResult<SampleOutcome> {
    device
        .trigger_measurement()
        .await
        .map_err(|e| DaqError::instrument(device.name(), e))?;
    match wait(waiter, device, deadline).await? {
        PollOutcome::TimedOut { waited } => Ok(SampleOutcome::TimedOut { waited }),
        PollOutcome::Ready { .. } => {
            let reading = device
                .fetch_result()
                .await
                .map_err(|e| DaqError::instrument(device.name(), e))?;
            Ok(SampleOutcome::Sample(reading.scalar(field)?))
        }
    }
}

/// Poll-Until-Ready with proxy failures mapped to [`DaqError::Instrument`].
pub async fn wait(
    waiter: &dyn ReadinessWaiter,
    device: &dyn DeviceProxy,
    deadline: Deadline,
) -> AppResult<PollOutcome> {
    waiter
        .wait_ready(device, deadline)
        .await
        .map_err(|e| DaqError::instrument(device.name(), e))
}

/// Device configuration with proxy failures mapped to [`DaqError::Instrument`].
pub async fn configuration_of(device: &dyn DeviceProxy) -> AppResult<DeviceConfig> {
    device
        .get_configuration()
        .await
        .map_err(|e| DaqError::instrument(device.name(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockPowerMeter;
    use poll::Poller;

    #[test]
    fn test_cycle_time_from_averaging() {
        let mut config = DeviceConfig::new();
        config.insert("averaging".into(), 3.into());
        let cycle = cycle_time(&config, Duration::from_millis(10), 5).unwrap();
        assert_eq!(cycle, Duration::from_millis(150));

        assert!(cycle_time(&config, Duration::from_millis(10), 0).is_err());
        config.insert("averaging".into(), 0.into());
        assert!(cycle_time(&config, Duration::from_millis(10), 5).is_err());
        assert!(cycle_time(&DeviceConfig::new(), Duration::from_millis(10), 5).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_scalar_outcomes() {
        let meter = MockPowerMeter::new(2.0).hang_after(1);
        let poller = Poller::default();
        let deadline = Deadline::Within(Duration::from_millis(100));

        match sample_scalar(&poller, &meter, POWER_FIELD, deadline).await.unwrap() {
            SampleOutcome::Sample(power) => assert!((power - 2.0).abs() < 0.01),
            other => panic!("expected a sample, got {other:?}"),
        }
        assert!(matches!(
            sample_scalar(&poller, &meter, POWER_FIELD, deadline).await.unwrap(),
            SampleOutcome::TimedOut { waited } if waited >= Duration::from_millis(100)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_scalar_missing_field() {
        let meter = MockPowerMeter::new(2.0);
        let result = sample_scalar(&Poller::default(), &meter, "energy", Deadline::Unbounded).await;
        assert!(matches!(result, Err(DaqError::MissingReadingField { .. })));
    }
}
