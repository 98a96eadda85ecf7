//! Entry point for acquisitions.
//!
//! The `Orchestrator` owns the instruments and the collaborators (waiter,
//! operator gate, dataset sink), runs one acquisition at a time and hands
//! every result to the sink. Device proxies carry no locking of their own, so
//! a second call waits for the first to finish.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::acquisition::excitation::{excitation_spectrum, SpectrumOutcome, SpectrumRequest};
use crate::acquisition::monitor::{monitor_power, MonitorRequest};
use crate::acquisition::poll::{Poller, ReadinessWaiter};
use crate::acquisition::tuning_curve::{tuning_curve, TuningCurveRequest};
use crate::acquisition::AcquisitionContext;
use crate::config::DaqConfig;
use crate::data::storage::{companion_path, DatasetSink};
use crate::data::{AcquisitionResult, PowerSeries, TuningCurve};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Camera, DeviceProxy, Tunable};
use crate::operator::OperatorGate;

/// The devices an orchestrator drives.
#[derive(Clone)]
pub struct Instruments {
    /// Tunable excitation source
    pub source: Arc<dyn Tunable>,
    /// Imaging device
    pub camera: Arc<dyn Camera>,
    /// Optional power reference
    pub power_meter: Option<Arc<dyn DeviceProxy>>,
}

/// Serializes acquisitions over a fixed set of instruments.
pub struct Orchestrator {
    instruments: Instruments,
    config: DaqConfig,
    waiter: Arc<dyn ReadinessWaiter>,
    gate: Arc<dyn OperatorGate>,
    sink: Arc<dyn DatasetSink>,
    busy: Mutex<()>,
}

impl Orchestrator {
    /// Orchestrator polling at `config.timing.poll_interval`.
    pub fn new(
        instruments: Instruments,
        config: DaqConfig,
        gate: Arc<dyn OperatorGate>,
        sink: Arc<dyn DatasetSink>,
    ) -> Self {
        let waiter = Arc::new(Poller::new(config.timing.poll_interval));
        Self {
            instruments,
            config,
            waiter,
            gate,
            sink,
            busy: Mutex::new(()),
        }
    }

    /// Replace the default busy-poll waiter.
    pub fn with_waiter(mut self, waiter: Arc<dyn ReadinessWaiter>) -> Self {
        self.waiter = waiter;
        self
    }

    /// Configuration this orchestrator was built with.
    pub fn config(&self) -> &DaqConfig {
        &self.config
    }

    /// `true` while an acquisition holds the instruments.
    pub fn is_acquiring(&self) -> bool {
        self.busy.try_lock().is_err()
    }

    fn context(&self) -> AcquisitionContext<'_> {
        AcquisitionContext {
            waiter: self.waiter.as_ref(),
            gate: self.gate.as_ref(),
            timing: &self.config.timing,
        }
    }

    fn power_meter(&self) -> AppResult<&dyn DeviceProxy> {
        self.instruments.power_meter.as_deref().ok_or_else(|| {
            DaqError::Configuration("this acquisition needs a power meter".to_string())
        })
    }

    /// Explicit location, or `<output_dir>/<dataset name>.<ext>`.
    fn location(&self, result: AcquisitionResult<'_>, explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => self
                .config
                .storage
                .output_dir
                .join(format!("{}.{}", result.metadata().name, self.sink.extension())),
        }
    }

    async fn persist(&self, result: AcquisitionResult<'_>, location: &Path) -> AppResult<PathBuf> {
        let path = self.sink.save(result, location).await?;
        info!(kind = result.kind(), path = %path.display(), "Acquisition persisted");
        Ok(path)
    }

    /// Continuous power monitoring; saves one dataset.
    pub async fn monitor_power(
        &self,
        request: &MonitorRequest,
        location: Option<&Path>,
    ) -> AppResult<PowerSeries> {
        let _guard = self.busy.lock().await;
        let meter = self.power_meter()?;
        let series = monitor_power(&self.context(), meter, request).await?;

        let result = AcquisitionResult::PowerSeries(&series);
        self.persist(result, &self.location(result, location)).await?;
        Ok(series)
    }

    /// Tuning curve of the source; saves one dataset, truncated if the meter timed out.
    pub async fn tuning_curve(
        &self,
        request: &TuningCurveRequest,
        location: Option<&Path>,
    ) -> AppResult<TuningCurve> {
        let _guard = self.busy.lock().await;
        let meter = self.power_meter()?;
        let curve = tuning_curve(
            &self.context(),
            self.instruments.source.as_ref(),
            meter,
            &self.config.source.range(),
            request,
        )
        .await?;

        let result = AcquisitionResult::TuningCurve(&curve);
        self.persist(result, &self.location(result, location)).await?;
        Ok(curve)
    }

    /// Excitation spectrum; saves the image cube, then the power trace next to it.
    pub async fn excitation_spectrum(
        &self,
        request: &SpectrumRequest,
        location: Option<&Path>,
    ) -> AppResult<SpectrumOutcome> {
        let _guard = self.busy.lock().await;
        let outcome = excitation_spectrum(
            &self.context(),
            self.instruments.source.as_ref(),
            self.instruments.camera.as_ref(),
            self.instruments.power_meter.as_deref(),
            &self.config.source.range(),
            request,
        )
        .await?;

        let images = AcquisitionResult::ImageCube(&outcome.images);
        let images_path = self.location(images, location);
        self.persist(images, &images_path).await?;

        if let Some(trace) = &outcome.power {
            let trace = AcquisitionResult::PowerTrace(trace);
            let power_path = match location {
                Some(_) => companion_path(&images_path, "power"),
                None => self.location(trace, None),
            };
            self.persist(trace, &power_path).await?;
        }
        Ok(outcome)
    }
}
