//! Gated synchronized acquisition: excitation spectrum.
//!
//! At each setpoint the camera takes one exposure while the power meter is
//! sampled as fast as it will go. The exposure gates the sampling: an exposure
//! watcher and a reference sampler run as two futures joined per setpoint, and
//! the watcher tells the sampler over a `watch` channel when the camera's busy
//! state flips. The sampler then stops triggering; a reading already in flight
//! still runs to completion or to its own deadline, so a hung meter is always
//! detected. Completion detection never waits on the meter.
//!
//! ```text
//! Positioning ──► ExposingAndSampling ──► Collected ──► next setpoint | Done
//! ```
//!
//! A meter timeout puts the scan in a degraded state: the current exposure keeps
//! the samples it already has and every later setpoint is imaged without
//! sampling. A timeout during the dark frame degrades the whole scan the same way.

use chrono::Utc;
use futures::future::join;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::dark::capture_dark_frame;
use super::plan::{validated_setpoints, ScanPlan, SpectralRange};
use super::poll::{Deadline, ReadinessWaiter};
use super::{
    configuration_of, cycle_time, sample_scalar, wait, AcquisitionContext, SampleOutcome,
    IMAGE_FIELD, POWER_FIELD,
};
use crate::data::{AcquisitionPhase, ImageCube, PowerTrace, TimeSeries, TimeoutEvent};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Camera, DeviceProxy, Tunable};
use crate::hardware::config_f64;
use crate::metadata::MetadataBuilder;

/// Where a setpoint is in its acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Moving the source to the setpoint
    Positioning,
    /// Camera exposing; the reference is sampled meanwhile
    ExposingAndSampling,
    /// Image fetched and stored
    Collected,
    /// All setpoints acquired
    Done,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ScanState::Positioning => "positioning",
            ScanState::ExposingAndSampling => "exposing",
            ScanState::Collected => "collected",
            ScanState::Done => "done",
        };
        f.write_str(label)
    }
}

/// Parameters of one excitation scan.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumRequest {
    /// Setpoints to visit
    pub plan: ScanPlan,
    /// Meter readings per sample, multiplies the per-sample deadline
    pub samples_per_point: usize,
    /// Image dataset name; defaults to `PLE-raw-images_<date>`
    pub name: Option<String>,
}

impl SpectrumRequest {
    /// Scan `plan` with 5 readings per sample and default names.
    pub fn new(plan: ScanPlan) -> Self {
        Self {
            plan,
            samples_per_point: 5,
            name: None,
        }
    }

    /// Set the meter readings per sample.
    pub fn with_samples_per_point(mut self, samples_per_point: usize) -> Self {
        self.samples_per_point = samples_per_point;
        self
    }

    /// Set the image dataset name; the power trace gets `<name>_power`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Images, and the power trace when a reference device took part.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumOutcome {
    /// One frame per setpoint plus the dark frame
    pub images: ImageCube,
    /// Present when a power meter took part
    pub power: Option<PowerTrace>,
}

/// Reference samples from one exposure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatedSamples {
    /// Elapsed times are measured from the exposure trigger
    pub series: TimeSeries,
    /// Time since the exposure trigger at which the reference timed out
    pub timed_out_at: Option<Duration>,
    /// Time since the exposure trigger at which the camera reported ready
    pub exposure: Duration,
}

/// Sample `reference` for as long as `exposure` stays busy.
///
/// The exposure must already be triggered; `exposure_started` is the instant it
/// was. Returns once the exposure is over and the last triggered reading has
/// either completed or timed out.
pub async fn sample_during_exposure(
    waiter: &dyn ReadinessWaiter,
    exposure: &dyn DeviceProxy,
    reference: &dyn DeviceProxy,
    deadline: Deadline,
    exposure_started: Instant,
) -> AppResult<GatedSamples> {
    let (done_tx, done_rx) = watch::channel(false);

    let watcher = async move {
        let outcome = wait(waiter, exposure, Deadline::Unbounded).await;
        // Stop the sampler even when the wait failed.
        let _ = done_tx.send(true);
        outcome.map(|_| exposure_started.elapsed())
    };
    let sampler = sample_until_done(waiter, reference, deadline, exposure_started, done_rx);

    let (exposure_outcome, sampled) = join(watcher, sampler).await;
    let exposure = exposure_outcome?;
    Ok(GatedSamples {
        exposure,
        ..sampled?
    })
}

/// Trigger readings until `done` is set. Readings are never abandoned mid-flight.
async fn sample_until_done(
    waiter: &dyn ReadinessWaiter,
    reference: &dyn DeviceProxy,
    deadline: Deadline,
    exposure_started: Instant,
    done: watch::Receiver<bool>,
) -> AppResult<GatedSamples> {
    let mut samples = GatedSamples::default();
    while !*done.borrow() {
        let elapsed = exposure_started.elapsed();
        match sample_scalar(waiter, reference, POWER_FIELD, deadline).await? {
            SampleOutcome::Sample(power) => samples.series.push(elapsed, power),
            SampleOutcome::TimedOut { .. } => {
                samples.timed_out_at = Some(exposure_started.elapsed());
                break;
            }
        }
    }
    Ok(samples)
}

/// Acquire one image per setpoint of `request.plan`, sampling `meter` during each exposure.
#[instrument(skip_all, fields(source = source.name(), camera = camera.name()))]
pub async fn excitation_spectrum(
    ctx: &AcquisitionContext<'_>,
    source: &dyn Tunable,
    camera: &dyn Camera,
    meter: Option<&dyn DeviceProxy>,
    range: &SpectralRange,
    request: &SpectrumRequest,
) -> AppResult<SpectrumOutcome> {
    let setpoints = validated_setpoints(&request.plan, range)?;

    let source_config = configuration_of(source.as_proxy()).await?;
    let camera_config = configuration_of(camera.as_proxy()).await?;
    let exposure_time = camera
        .get_exposure()
        .await
        .map_err(|e| DaqError::instrument(camera.name(), e))?;
    let meter_setup = match meter {
        Some(meter) => {
            let config = configuration_of(meter).await?;
            let cycle = cycle_time(&config, ctx.timing.sample_period, request.samples_per_point)?;
            Some((meter, config, cycle))
        }
        None => None,
    };
    let deadline = meter_setup
        .as_ref()
        .map_or(Deadline::Unbounded, |(_, _, cycle)| Deadline::Within(*cycle));

    let started_at = Utc::now();
    let date = started_at.format("%Y-%m-%d");
    let image_name = request
        .name
        .clone()
        .unwrap_or_else(|| format!("PLE-raw-images_{date}"));
    let power_name = match &request.name {
        Some(name) => format!("{name}_power"),
        None => format!("PLE-power-readings_{date}"),
    };

    ctx.gate
        .prompt("Block the excitation beam to take the dark frame", ctx.timing.prompt_settle)
        .await?;
    info!("Measuring dark frame");
    let dark = capture_dark_frame(ctx, camera, meter, deadline).await?;

    ctx.gate
        .prompt("Unblock the excitation beam", ctx.timing.prompt_settle)
        .await?;
    info!(wait = ?ctx.timing.source_stabilization, "Waiting for the source to stabilize");
    tokio::time::sleep(ctx.timing.source_stabilization).await;

    let mut timeouts: Vec<TimeoutEvent> = dark.timeout.iter().cloned().collect();
    let mut reference = meter.filter(|_| dark.timeout.is_none());
    let mut frames = Vec::with_capacity(setpoints.len());
    let mut series = Vec::with_capacity(setpoints.len());
    let mut max_observed_length = 0;
    let started = Instant::now();

    for &setpoint in &setpoints {
        debug!(setpoint, state = %ScanState::Positioning);
        source
            .set_position(setpoint)
            .await
            .map_err(|e| DaqError::instrument(source.name(), e))?;
        wait(ctx.waiter, source.as_proxy(), Deadline::Unbounded).await?;

        debug!(setpoint, state = %ScanState::ExposingAndSampling);
        camera
            .trigger_measurement()
            .await
            .map_err(|e| DaqError::instrument(camera.name(), e))?;
        let exposure_started = Instant::now();
        let samples = match reference {
            Some(device) => {
                let gated = sample_during_exposure(
                    ctx.waiter,
                    camera.as_proxy(),
                    device,
                    deadline,
                    exposure_started,
                )
                .await?;
                if let Some(at) = gated.timed_out_at {
                    warn!(
                        device = device.name(),
                        setpoint,
                        after_ms = at.as_millis() as u64,
                        "Power meter timed out while measuring at {setpoint} nm, proceeding without power readings"
                    );
                    timeouts.push(TimeoutEvent {
                        device: device.name().to_string(),
                        phase: AcquisitionPhase::Sweep,
                        setpoint: Some(setpoint),
                        elapsed_s: started.elapsed().as_secs_f64(),
                    });
                    reference = None;
                }
                gated.series
            }
            None => {
                wait(ctx.waiter, camera.as_proxy(), Deadline::Unbounded).await?;
                TimeSeries::default()
            }
        };

        let frame = camera
            .fetch_result()
            .await
            .map_err(|e| DaqError::instrument(camera.name(), e))?
            .into_image(IMAGE_FIELD)?;
        max_observed_length = max_observed_length.max(samples.len());
        debug!(setpoint, samples = samples.len(), state = %ScanState::Collected);
        frames.push(frame);
        series.push(samples);
    }
    debug!(setpoints = setpoints.len(), max_observed_length, state = %ScanState::Done);

    let mut images_meta = MetadataBuilder::new(image_name, started_at)
        .plan(request.plan)
        .instrument(source.name(), source_config.clone())
        .instrument(camera.name(), camera_config.clone())
        .parameter("exposure_time_s", exposure_time);
    if let Some((meter, config, _)) = &meter_setup {
        images_meta = images_meta.instrument(meter.name(), config.clone());
    }
    let images_meta = images_meta.build();
    let run_id = images_meta.run_id;

    let images = ImageCube {
        metadata: images_meta,
        setpoints: setpoints.clone(),
        frames,
        dark_frame: dark.frame,
    };

    let power = match meter_setup {
        Some((meter, config, cycle)) => {
            let metadata = MetadataBuilder::new(power_name, started_at)
                .run_id(run_id)
                .plan(request.plan)
                .instrument(source.name(), source_config)
                .instrument(camera.name(), camera_config)
                .instrument(meter.name(), config.clone())
                .parameter("exposure_time_s", exposure_time)
                .parameter("samples_per_point", request.samples_per_point)
                .parameter("cycle_time_s", cycle.as_secs_f64())
                .parameter("averaging", config_f64(&config, "averaging")?)
                .parameter("dark_reading", dark.power)
                .build();
            Some(PowerTrace::from_series(
                metadata,
                setpoints,
                series,
                dark.power,
                timeouts,
            ))
        }
        None => None,
    };

    Ok(SpectrumOutcome { images, power })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::poll::Poller;
    use crate::config::TimingConfig;
    use crate::hardware::mock::{MockCamera, MockOpo, MockPowerMeter};
    use crate::operator::AutoConfirm;
    use tracing_test::traced_test;

    fn plan() -> ScanPlan {
        ScanPlan::new(450.0, 470.0, 10.0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_gated_sampling_stops_with_exposure() {
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(50));
        let meter = MockPowerMeter::new(1.0e-3).with_measure_time(Duration::from_millis(5));
        let poller = Poller::default();

        camera.trigger_measurement().await.unwrap();
        let started = Instant::now();
        let gated = sample_during_exposure(
            &poller,
            &camera,
            &meter,
            Deadline::Within(Duration::from_millis(50)),
            started,
        )
        .await
        .unwrap();

        assert!((9..=11).contains(&gated.series.len()), "got {}", gated.series.len());
        assert!(gated.timed_out_at.is_none());
        // The last reading may be triggered as the exposure ends; it is still kept.
        assert!(gated.series.times.iter().all(|&t| t <= 0.05));
        assert!(gated.exposure >= Duration::from_millis(50));
        assert!(!camera.is_busy().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_reference_does_not_delay_exposure() {
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(30));
        let meter = MockPowerMeter::new(1.0e-3).hang_after(1);
        let poller = Poller::default();

        camera.trigger_measurement().await.unwrap();
        let started = Instant::now();
        let gated = sample_during_exposure(
            &poller,
            &camera,
            &meter,
            Deadline::Within(Duration::from_millis(100)),
            started,
        )
        .await
        .unwrap();

        assert_eq!(gated.series.len(), 1);
        assert!(gated.exposure >= Duration::from_millis(30));
        assert!(gated.exposure < Duration::from_millis(32));
        // The hung reading runs to its own deadline after the exposure is over.
        let timed_out_at = gated.timed_out_at.unwrap();
        assert!(timed_out_at >= Duration::from_millis(110));
        assert!(timed_out_at < Duration::from_millis(112));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reading_longer_than_exposure_is_kept() {
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(30));
        let meter = MockPowerMeter::new(1.0e-3).with_measure_time(Duration::from_millis(40));
        let poller = Poller::default();

        camera.trigger_measurement().await.unwrap();
        let gated = sample_during_exposure(
            &poller,
            &camera,
            &meter,
            Deadline::Within(Duration::from_millis(50)),
            Instant::now(),
        )
        .await
        .unwrap();

        assert_eq!(gated.series.len(), 1);
        assert_eq!(gated.series.times, vec![0.0]);
        assert!(gated.timed_out_at.is_none());
        assert_eq!(meter.trigger_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_reference_timeout_degrades_rest_of_scan() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let opo = MockOpo::new();
        // Exposure longer than the 50ms sample deadline, so the hang is detected.
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(200));
        // Dark reading plus 3 samples, then hung.
        let meter = MockPowerMeter::new(1.0e-3).hang_after(4);

        let outcome = excitation_spectrum(
            &ctx,
            &opo,
            &camera,
            Some(&meter as &dyn DeviceProxy),
            &SpectralRange::new(420.0, 700.0),
            &SpectrumRequest::new(plan()),
        )
        .await
        .unwrap();

        assert_eq!(outcome.images.frames.len(), 3);
        let power = outcome.power.unwrap();
        assert_eq!(power.valid_counts, vec![3, 0, 0]);
        assert_eq!(power.max_observed_length, 3);
        assert_eq!(power.timeouts.len(), 1);
        assert_eq!(power.timeouts[0].setpoint, Some(450.0));
        assert_eq!(meter.trigger_count(), 5);
        assert!(logs_contain("proceeding without power readings"));
        assert!(logs_contain("450"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_reference_device() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let opo = MockOpo::new();
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(20));

        let outcome = excitation_spectrum(
            &ctx,
            &opo,
            &camera,
            None,
            &SpectralRange::new(420.0, 700.0),
            &SpectrumRequest::new(plan()).with_name("run"),
        )
        .await
        .unwrap();

        assert!(outcome.power.is_none());
        assert_eq!(outcome.images.setpoints, vec![450.0, 460.0, 470.0]);
        assert_eq!(outcome.images.metadata.name, "run");
        // Dark frame plus one per setpoint.
        assert_eq!(camera.frame_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_hung_reference_detected_with_short_exposures() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let opo = MockOpo::new();
        // Exposure shorter than the 50ms sample deadline.
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(20));
        // Only the dark reading succeeds.
        let meter = MockPowerMeter::new(1.0e-3).hang_after(1);

        let outcome = excitation_spectrum(
            &ctx,
            &opo,
            &camera,
            Some(&meter as &dyn DeviceProxy),
            &SpectralRange::new(420.0, 700.0),
            &SpectrumRequest::new(ScanPlan::new(450.0, 490.0, 10.0).unwrap()),
        )
        .await
        .unwrap();

        let power = outcome.power.unwrap();
        assert_eq!(power.valid_counts, vec![0; 5]);
        assert_eq!(power.timeouts.len(), 1);
        assert_eq!(power.timeouts[0].setpoint, Some(450.0));
        assert_eq!(power.dark_power.map(|p| p > 0.0), Some(true));
        // Dark reading plus the hung one; later setpoints do not trigger.
        assert_eq!(meter.trigger_count(), 2);
        assert_eq!(camera.frame_count(), 6);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("proceeding without power readings"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one timeout warning, got {n}")),
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reference_keeps_one_sample_per_exposure() {
        let timing = TimingConfig::default().without_settle_delays();
        let (poller, gate) = (Poller::default(), AutoConfirm::new());
        let ctx = AcquisitionContext { waiter: &poller, gate: &gate, timing: &timing };
        let opo = MockOpo::new();
        let camera = MockCamera::new(2, 2).with_exposure(Duration::from_millis(30));
        // Slower than the exposure, still inside the 50ms deadline.
        let meter = MockPowerMeter::new(1.0e-3).with_measure_time(Duration::from_millis(40));

        let outcome = excitation_spectrum(
            &ctx,
            &opo,
            &camera,
            Some(&meter as &dyn DeviceProxy),
            &SpectralRange::new(420.0, 700.0),
            &SpectrumRequest::new(ScanPlan::new(450.0, 490.0, 10.0).unwrap()),
        )
        .await
        .unwrap();

        let power = outcome.power.unwrap();
        assert_eq!(power.valid_counts, vec![1; 5]);
        assert_eq!(power.max_observed_length, 1);
        assert!(power.timeouts.is_empty());
        assert!(power.power.iter().all(|row| row[0].is_some()));
        assert_eq!(meter.trigger_count(), 6);
    }
}
