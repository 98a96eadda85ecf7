//! Swept scalar acquisition: mean reference power at each source setpoint.
//!
//! Order of operations:
//! 1. Validate every setpoint against the source range (nothing moves on failure).
//! 2. Operator blocks the beam; a dark baseline is measured. A timeout here aborts.
//! 3. Operator unblocks the beam; wait for the source to stabilize.
//! 4. For each setpoint: move, wait, settle, take `samples_per_point` readings.
//!
//! The first timeout in step 4 stops the sweep. The result then holds exactly the
//! setpoints completed before the one that timed out.

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use super::dark::measure_dark_reference;
use super::plan::{validated_setpoints, ScanPlan, SpectralRange};
use super::poll::Deadline;
use super::{
    configuration_of, cycle_time, sample_scalar, wait, AcquisitionContext, SampleOutcome,
    POWER_FIELD,
};
use crate::data::{AcquisitionPhase, AggregatedPoint, TimeoutEvent, TuningCurve};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DeviceProxy, Tunable};
use crate::metadata::MetadataBuilder;

/// Parameters of one tuning-curve sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningCurveRequest {
    /// Setpoints to visit
    pub plan: ScanPlan,
    /// Readings averaged per setpoint, also used for the dark baseline
    pub samples_per_point: usize,
    /// Dataset name; defaults to `OPO-tuning-curve_<date>`
    pub name: Option<String>,
}

impl TuningCurveRequest {
    /// Curve over `plan` averaging 100 readings per point.
    pub fn new(plan: ScanPlan) -> Self {
        Self {
            plan,
            samples_per_point: 100,
            name: None,
        }
    }

    /// Set the readings averaged per point.
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

/// Measure the source's output power across `request.plan`.
#[instrument(skip_all, fields(source = source.name(), meter = meter.name()))]
pub async fn tuning_curve(
    ctx: &AcquisitionContext<'_>,
    source: &dyn Tunable,
    meter: &dyn DeviceProxy,
    range: &SpectralRange,
    request: &TuningCurveRequest,
) -> AppResult<TuningCurve> {
    let setpoints = validated_setpoints(&request.plan, range)?;
    let samples = request.samples_per_point;
    if samples == 0 {
        return Err(DaqError::Configuration(
            "samples per point must be at least 1".to_string(),
        ));
    }

    let meter_config = configuration_of(meter).await?;
    let source_config = configuration_of(source.as_proxy()).await?;
    let cycle = cycle_time(&meter_config, ctx.timing.sample_period, samples)?;
    let deadline = Deadline::Within(cycle.mul_f64(ctx.timing.sweep_timeout_cycles));

    let started_at = Utc::now();
    let name = request
        .name
        .clone()
        .unwrap_or_else(|| format!("OPO-tuning-curve_{}", started_at.format("%Y-%m-%d")));

    ctx.gate
        .prompt("Block the excitation beam to measure the dark reference", ctx.timing.prompt_settle)
        .await?;
    info!(samples, "Measuring dark reference");
    let dark_reference = measure_dark_reference(ctx, meter, samples, deadline).await?;

    ctx.gate
        .prompt("Unblock the excitation beam", ctx.timing.prompt_settle)
        .await?;
    info!(wait = ?ctx.timing.source_stabilization, "Waiting for the source to stabilize");
    sleep(ctx.timing.source_stabilization).await;

    let started = Instant::now();
    let mut points = Vec::with_capacity(setpoints.len());
    let mut timeouts = Vec::new();
    'sweep: for &setpoint in &setpoints {
        source
            .set_position(setpoint)
            .await
            .map_err(|e| DaqError::instrument(source.name(), e))?;
        wait(ctx.waiter, source.as_proxy(), Deadline::Unbounded).await?;
        sleep(ctx.timing.move_settle).await;

        let mut values = Vec::with_capacity(samples);
        for _ in 0..samples {
            match sample_scalar(ctx.waiter, meter, POWER_FIELD, deadline).await? {
                SampleOutcome::Sample(power) => values.push(power),
                SampleOutcome::TimedOut { .. } => {
                    warn!(
                        device = meter.name(),
                        setpoint,
                        completed = points.len(),
                        "Power meter timed out at {setpoint} nm, saving the points measured so far"
                    );
                    timeouts.push(TimeoutEvent {
                        device: meter.name().to_string(),
                        phase: AcquisitionPhase::Sweep,
                        setpoint: Some(setpoint),
                        elapsed_s: started.elapsed().as_secs_f64(),
                    });
                    break 'sweep;
                }
            }
        }

        if let Some(point) = AggregatedPoint::reduce(&values) {
            info!("{setpoint} nm, {:e} +/- {:e} W", point.mean, point.std_dev);
            points.push(point);
        }
    }

    let mut completed = setpoints;
    completed.truncate(points.len());

    let metadata = MetadataBuilder::new(name, started_at)
        .plan(request.plan)
        .instrument(source.name(), source_config)
        .instrument(meter.name(), meter_config)
        .parameter("samples_per_point", samples)
        .parameter("cycle_time_s", cycle.as_secs_f64())
        .parameter("dark_reading", vec![dark_reference.mean, dark_reference.std_dev])
        .build();

    Ok(TuningCurve {
        metadata,
        dark_reference,
        setpoints: completed,
        points,
        timeouts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::poll::Poller;
    use crate::config::TimingConfig;
    use crate::hardware::mock::{MockOpo, MockPowerMeter};
    use crate::operator::AutoConfirm;

    fn plan() -> ScanPlan {
        ScanPlan::new(450.0, 500.0, 10.0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sweep() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let (opo, meter) = (MockOpo::new(), MockPowerMeter::new(2.0e-3));
        let request = TuningCurveRequest::new(plan()).with_samples_per_point(4);

        let curve = tuning_curve(&ctx, &opo, &meter, &SpectralRange::new(420.0, 700.0), &request)
            .await
            .unwrap();

        assert_eq!(curve.setpoints, plan().setpoints());
        assert_eq!(curve.points.len(), 6);
        assert!(curve.points.iter().all(|p| p.samples == 4));
        assert!(!curve.truncated());
        assert_eq!(meter.trigger_count(), 4 + 6 * 4);
        assert_eq!(opo.history().await, plan().setpoints());
        assert_eq!(gate.prompts().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_points_before_setpoint() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let n = 3;

        for j in 0..6 {
            // Dark samples, then j full setpoints, then one sample into setpoint j.
            let meter = MockPowerMeter::new(2.0e-3).hang_after(n + j * n + 1);
            let opo = MockOpo::new();
            let request = TuningCurveRequest::new(plan()).with_samples_per_point(n);

            let curve = tuning_curve(&ctx, &opo, &meter, &SpectralRange::new(420.0, 700.0), &request)
                .await
                .unwrap();

            assert_eq!(curve.points.len(), j);
            assert_eq!(curve.setpoints, plan().setpoints()[..j].to_vec());
            assert_eq!(curve.timeouts[0].setpoint, Some(plan().setpoints()[j]));
            // No setpoint after the failing one is visited.
            assert_eq!(opo.history().await.len(), j + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_fails_before_motion() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let (opo, meter) = (MockOpo::new(), MockPowerMeter::new(2.0e-3));

        let result = tuning_curve(
            &ctx,
            &opo,
            &meter,
            &SpectralRange::new(460.0, 700.0),
            &TuningCurveRequest::new(plan()),
        )
        .await;

        assert!(matches!(result, Err(DaqError::ScanOutOfRange { setpoint, .. }) if setpoint == 450.0));
        assert!(opo.history().await.is_empty());
        assert_eq!(meter.trigger_count(), 0);
        assert!(gate.prompts().await.is_empty());
    }
}
