//! Mock Hardware Implementations
//!
//! Provides simulated instruments for testing without physical hardware.
//! All mock devices keep their busy state as a deadline on the tokio clock, so tests
//! running with a paused clock (`#[tokio::test(start_paused = true)]`) see exact,
//! deterministic timing.
//!
//! # Available Mocks
//!
//! - `MockOpo` - Tunable excitation source with a fixed tuning time
//! - `MockCamera` - Area sensor that stays busy for one exposure
//! - `MockPowerMeter` - Power reference with failure injection
//!
//! # Performance Characteristics
//!
//! - MockOpo: 50ms per move, range 420-700 nm
//! - MockCamera: busy for the configured exposure (default 100ms)
//! - MockPowerMeter: busy for `averaging x 10ms` per reading

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::hardware::capabilities::{DeviceProxy, ExposureControl, Tunable};
use crate::hardware::{DeviceConfig, Frame, Reading};

/// Time one averaging unit takes on the simulated power meter.
pub const MOCK_SAMPLE_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy)]
enum BusyState {
    Idle,
    Until(Instant),
    Forever,
}

impl BusyState {
    fn is_busy(&self) -> bool {
        match self {
            BusyState::Idle => false,
            BusyState::Until(deadline) => Instant::now() < *deadline,
            BusyState::Forever => true,
        }
    }
}

// =============================================================================
// MockOpo - Simulated Tunable Source
// =============================================================================

/// Mock optical parametric oscillator
///
/// Simulates a tunable source with:
/// - Fixed tuning time per move (default 50ms)
/// - Hard range limits (default 420-700 nm)
/// - A log of every commanded setpoint, for asserting scan order
pub struct MockOpo {
    name: String,
    range: (f64, f64),
    tune_time: Duration,
    position: RwLock<f64>,
    state: RwLock<BusyState>,
    history: RwLock<Vec<f64>>,
}

impl MockOpo {
    /// Create a new mock OPO parked at 500 nm.
    pub fn new() -> Self {
        Self {
            name: "opo".to_string(),
            range: (420.0, 700.0),
            tune_time: Duration::from_millis(50),
            position: RwLock::new(500.0),
            state: RwLock::new(BusyState::Idle),
            history: RwLock::new(Vec::new()),
        }
    }

    /// Override the reachable range.
    pub fn with_range(mut self, min_nm: f64, max_nm: f64) -> Self {
        self.range = (min_nm, max_nm);
        self
    }

    /// Override the time a move keeps the device busy.
    pub fn with_tune_time(mut self, tune_time: Duration) -> Self {
        self.tune_time = tune_time;
        self
    }

    /// Every setpoint commanded so far, in order.
    pub async fn history(&self) -> Vec<f64> {
        self.history.read().await.clone()
    }
}

impl Default for MockOpo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceProxy for MockOpo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_measurement(&self) -> Result<()> {
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self.state.read().await.is_busy())
    }

    async fn fetch_result(&self) -> Result<Reading> {
        Ok(Reading::new().with_scalar("position", *self.position.read().await))
    }

    async fn get_configuration(&self) -> Result<DeviceConfig> {
        let mut config = DeviceConfig::new();
        config.insert("min_position".into(), self.range.0.into());
        config.insert("max_position".into(), self.range.1.into());
        config.insert("units".into(), "nm".into());
        Ok(config)
    }
}

#[async_trait]
impl Tunable for MockOpo {
    async fn set_position(&self, position: f64) -> Result<()> {
        let (min, max) = self.range;
        if !(min..=max).contains(&position) {
            return Err(anyhow!(
                "MockOpo: {} nm out of range ({}-{} nm)",
                position,
                min,
                max
            ));
        }
        debug!(position, "MockOpo: tuning");
        *self.position.write().await = position;
        *self.state.write().await = BusyState::Until(Instant::now() + self.tune_time);
        self.history.write().await.push(position);
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.read().await)
    }
}

// =============================================================================
// MockCamera - Simulated Area Sensor
// =============================================================================

/// Mock camera
///
/// Simulates an area sensor with:
/// - Configurable resolution and exposure
/// - Busy for exactly one exposure after each trigger
/// - Test-pattern frames that change with every exposure
pub struct MockCamera {
    name: String,
    resolution: (u32, u32),
    exposure: RwLock<Duration>,
    state: RwLock<BusyState>,
    frame_count: AtomicU64,
    last_frame: RwLock<Option<Frame>>,
}

impl MockCamera {
    /// Create new mock camera with specified resolution and a 100ms exposure.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            name: "camera".to_string(),
            resolution: (width, height),
            exposure: RwLock::new(Duration::from_millis(100)),
            state: RwLock::new(BusyState::Idle),
            frame_count: AtomicU64::new(0),
            last_frame: RwLock::new(None),
        }
    }

    /// Builder: set the exposure.
    pub fn with_exposure(self, exposure: Duration) -> Self {
        Self {
            exposure: RwLock::new(exposure),
            ..self
        }
    }

    /// Get total number of exposures triggered
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(64, 48)
    }
}

#[async_trait]
impl DeviceProxy for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_measurement(&self) -> Result<()> {
        let count = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let exposure = *self.exposure.read().await;
        debug!(frame = count, ?exposure, "MockCamera: exposure started");

        let (width, height) = self.resolution;
        let pixels: Vec<u16> = (0..(width * height))
            .map(|i| ((i as u64 + count) % 65536) as u16)
            .collect();
        *self.last_frame.write().await = Some(Frame::new(width, height, pixels));
        *self.state.write().await = BusyState::Until(Instant::now() + exposure);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self.state.read().await.is_busy())
    }

    async fn fetch_result(&self) -> Result<Reading> {
        let frame = self
            .last_frame
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("MockCamera: no exposure taken yet"))?;
        Ok(Reading::new().with_image("image", frame))
    }

    async fn get_configuration(&self) -> Result<DeviceConfig> {
        let mut config = DeviceConfig::new();
        config.insert("aoi_width".into(), i64::from(self.resolution.0).into());
        config.insert("aoi_height".into(), i64::from(self.resolution.1).into());
        config.insert(
            "exposure_time".into(),
            self.exposure.read().await.as_secs_f64().into(),
        );
        config.insert("pixel_readout_rate".into(), "280 MHz".into());
        config.insert("electronic_shuttering_mode".into(), "Rolling".into());
        Ok(config)
    }
}

#[async_trait]
impl ExposureControl for MockCamera {
    async fn get_exposure(&self) -> Result<f64> {
        Ok(self.exposure.read().await.as_secs_f64())
    }

    async fn set_exposure(&self, seconds: f64) -> Result<()> {
        if !(seconds > 0.0 && seconds.is_finite()) {
            return Err(anyhow!("MockCamera: Exposure must be positive"));
        }
        *self.exposure.write().await = Duration::from_secs_f64(seconds);
        Ok(())
    }
}

// =============================================================================
// MockPowerMeter - Simulated Power Meter
// =============================================================================

/// Mock power meter with simulated readings
///
/// Simulates a power meter with:
/// - Configurable base power value (Watts) and small deterministic noise
/// - Averaging setting reported through the configuration
/// - Optional hang after a given number of successful readings
///
/// # Example
///
/// ```rust,ignore
/// // Answers twice, then stays busy forever
/// let meter = MockPowerMeter::new(2.5e-3).hang_after(2);
/// ```
pub struct MockPowerMeter {
    name: String,
    base_power: RwLock<f64>,
    averaging: u32,
    measure_time: Duration,
    hang_after: Option<usize>,
    state: RwLock<BusyState>,
    triggers: AtomicUsize,
    last_power: RwLock<Option<f64>>,
}

impl MockPowerMeter {
    /// Create new mock power meter with specified base power (Watts)
    pub fn new(base_power: f64) -> Self {
        Self {
            name: "power_meter".to_string(),
            base_power: RwLock::new(base_power),
            averaging: 1,
            measure_time: MOCK_SAMPLE_PERIOD,
            hang_after: None,
            state: RwLock::new(BusyState::Idle),
            triggers: AtomicUsize::new(0),
            last_power: RwLock::new(None),
        }
    }

    /// Set the averaging count; one reading then takes `averaging x 10ms`.
    pub fn with_averaging(mut self, averaging: u32) -> Self {
        self.averaging = averaging;
        self.measure_time = MOCK_SAMPLE_PERIOD * averaging;
        self
    }

    /// Override how long one reading keeps the meter busy.
    pub fn with_measure_time(mut self, measure_time: Duration) -> Self {
        self.measure_time = measure_time;
        self
    }

    /// Answer `count` triggers, then stay busy forever.
    pub fn hang_after(mut self, count: usize) -> Self {
        self.hang_after = Some(count);
        self
    }

    /// Never finish a measurement.
    pub fn always_busy(self) -> Self {
        self.hang_after(0)
    }

    /// Set the base power reading
    pub async fn set_base_power(&self, power: f64) {
        *self.base_power.write().await = power;
    }

    /// Number of triggers received so far.
    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl Default for MockPowerMeter {
    fn default() -> Self {
        Self::new(1.0e-3)
    }
}

#[async_trait]
impl DeviceProxy for MockPowerMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn trigger_measurement(&self) -> Result<()> {
        let n = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hang_after.is_some_and(|limit| n > limit) {
            debug!(trigger = n, "MockPowerMeter: hung");
            *self.state.write().await = BusyState::Forever;
            return Ok(());
        }

        // ~0.2% deterministic ripple
        let ripple = 1.0 + 0.002 * (((n * 7) % 5) as f64 - 2.0);
        let reading = *self.base_power.read().await * ripple;
        *self.last_power.write().await = Some(reading);
        *self.state.write().await = BusyState::Until(Instant::now() + self.measure_time);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(self.state.read().await.is_busy())
    }

    async fn fetch_result(&self) -> Result<Reading> {
        let power = self
            .last_power
            .read()
            .await
            .ok_or_else(|| anyhow!("MockPowerMeter: no reading taken yet"))?;
        Ok(Reading::new().with_scalar("power", power))
    }

    async fn get_configuration(&self) -> Result<DeviceConfig> {
        let mut config = DeviceConfig::new();
        config.insert("averaging".into(), i64::from(self.averaging).into());
        config.insert("units".into(), "W".into());
        Ok(config)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
