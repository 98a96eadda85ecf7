//! Dark references taken with the excitation blocked.
//!
//! The tuning curve needs a full baseline and cannot continue without it. The
//! excitation spectrum needs one dark frame; its power reading is a bonus and a
//! reference timeout only degrades the rest of the scan.

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::poll::Deadline;
use super::{sample_scalar, wait, AcquisitionContext, SampleOutcome, IMAGE_FIELD, POWER_FIELD};
use crate::data::{AcquisitionPhase, AggregatedPoint, TimeoutEvent};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Camera, DeviceProxy};
use crate::hardware::Frame;

/// Take `samples` readings and reduce them; any timeout aborts.
pub async fn measure_dark_reference(
    ctx: &AcquisitionContext<'_>,
    meter: &dyn DeviceProxy,
    samples: usize,
    deadline: Deadline,
) -> AppResult<AggregatedPoint> {
    let mut values = Vec::with_capacity(samples);
    for _ in 0..samples {
        match sample_scalar(ctx.waiter, meter, POWER_FIELD, deadline).await? {
            SampleOutcome::Sample(power) => values.push(power),
            SampleOutcome::TimedOut { waited } => {
                warn!(
                    device = meter.name(),
                    collected = values.len(),
                    waited_ms = waited.as_millis() as u64,
                    "Power meter timed out during the dark reference, aborting acquisition"
                );
                return Err(DaqError::DarkReferenceAborted {
                    collected: values.len(),
                    required: samples,
                });
            }
        }
    }
    AggregatedPoint::reduce(&values).ok_or_else(|| {
        DaqError::Configuration("dark reference needs at least one sample".to_string())
    })
}

/// Dark frame plus the reference reading taken during it.
#[derive(Debug, Clone, PartialEq)]
pub struct DarkFrame {
    /// Image taken with the excitation blocked
    pub frame: Frame,
    /// `None` without a reference device or when it timed out
    pub power: Option<f64>,
    /// Set when the reference device timed out; the scan then runs without it.
    pub timeout: Option<TimeoutEvent>,
}

/// One exposure with the excitation blocked, sampling the reference once if present.
pub async fn capture_dark_frame(
    ctx: &AcquisitionContext<'_>,
    camera: &dyn Camera,
    meter: Option<&dyn DeviceProxy>,
    deadline: Deadline,
) -> AppResult<DarkFrame> {
    if meter.is_some() {
        debug!(wait = ?ctx.timing.meter_stabilization, "Waiting for the power meter to stabilize");
        sleep(ctx.timing.meter_stabilization).await;
    }

    let started = Instant::now();
    camera
        .trigger_measurement()
        .await
        .map_err(|e| DaqError::instrument(camera.name(), e))?;

    let mut power = None;
    let mut timeout = None;
    if let Some(meter) = meter {
        match sample_scalar(ctx.waiter, meter, POWER_FIELD, deadline).await? {
            SampleOutcome::Sample(value) => power = Some(value),
            SampleOutcome::TimedOut { .. } => {
                warn!(
                    device = meter.name(),
                    "Power meter timed out during the dark frame, proceeding without power readings"
                );
                timeout = Some(TimeoutEvent {
                    device: meter.name().to_string(),
                    phase: AcquisitionPhase::DarkReference,
                    setpoint: None,
                    elapsed_s: started.elapsed().as_secs_f64(),
                });
            }
        }
    }

    wait(ctx.waiter, camera.as_proxy(), Deadline::Unbounded).await?;
    let frame = camera
        .fetch_result()
        .await
        .map_err(|e| DaqError::instrument(camera.name(), e))?
        .into_image(IMAGE_FIELD)?;

    Ok(DarkFrame {
        frame,
        power,
        timeout,
    })
}
