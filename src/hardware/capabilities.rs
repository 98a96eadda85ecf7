//! Device Capabilities
//!
//! Every instrument the scheduler talks to is reached through a remote daemon that
//! offers the same four operations: trigger a measurement, ask whether the device is
//! busy, fetch the last result, and read the configuration. `DeviceProxy` is that
//! uniform view. Devices that can do more implement additional, fine-grained traits:
//!
//! - A power meter implements: `DeviceProxy`
//! - A camera implements: `DeviceProxy + ExposureControl`
//! - An OPO implements: `DeviceProxy + Tunable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! None of the daemons offer event notification or cancellation. The proxy is a
//! stateless handle; every state change has to be discovered by polling `is_busy`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn single_reading(meter: &dyn DeviceProxy) -> Result<Reading> {
//!     meter.trigger_measurement().await?;
//!     while meter.is_busy().await? {
//!         tokio::time::sleep(Duration::from_millis(1)).await;
//!     }
//!     meter.fetch_result().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;

use crate::hardware::{DeviceConfig, Reading};

/// Capability: Remote Measurement
///
/// The minimal daemon interface shared by every instrument.
///
/// # Contract
/// - `trigger_measurement` starts one measurement and returns immediately
/// - `is_busy` is cheap and idempotent; callers may invoke it every millisecond
/// - `fetch_result` after `is_busy() == false` yields the most recent measurement
/// - `get_configuration` returns the daemon's key/value configuration
#[async_trait]
pub trait DeviceProxy: Send + Sync {
    /// Human readable device name used in logs and dataset metadata.
    fn name(&self) -> &str;

    /// Start a measurement (an exposure, a power reading, ...).
    async fn trigger_measurement(&self) -> Result<()>;

    /// Whether the device is still working on the last request.
    async fn is_busy(&self) -> Result<bool>;

    /// Fetch the result of the most recent measurement.
    async fn fetch_result(&self) -> Result<Reading>;

    /// Fetch the daemon configuration.
    async fn get_configuration(&self) -> Result<DeviceConfig>;
}

/// Access to the plain proxy view of a richer capability object.
///
/// Blanket-implemented for every sized `DeviceProxy`, so `dyn Tunable` and
/// `dyn Camera` can be handed to code that only needs to poll.
pub trait AsProxy {
    /// Borrow as a `DeviceProxy` trait object.
    fn as_proxy(&self) -> &dyn DeviceProxy;
}

impl<T: DeviceProxy> AsProxy for T {
    fn as_proxy(&self) -> &dyn DeviceProxy {
        self
    }
}

/// Capability: Tunable Setpoint
///
/// Devices with a single swept parameter (an OPO's output wavelength, a
/// monochromator grating angle).
///
/// # Contract
/// - `set_position` initiates motion and returns before completion
/// - Completion is observed by polling `is_busy`
/// - Units are device-native (nanometers for an OPO)
#[async_trait]
pub trait Tunable: DeviceProxy + AsProxy {
    /// Move to an absolute setpoint.
    async fn set_position(&self, position: f64) -> Result<()>;

    /// Last commanded setpoint.
    async fn position(&self) -> Result<f64>;
}

/// Capability: Exposure Time Control
///
/// Devices with an integration time (cameras, spectrometers).
///
/// # Contract
/// - Exposure is in seconds (not milliseconds)
/// - Setting exposure does not start acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Current exposure setting in seconds.
    async fn get_exposure(&self) -> Result<f64>;

    /// Set exposure/integration time in seconds.
    ///
    /// # Default Implementation
    /// Returns an error indicating the daemon does not allow it.
    async fn set_exposure(&self, _seconds: f64) -> Result<()> {
        anyhow::bail!("Exposure control not supported by this device")
    }
}

/// Combined trait for area sensors driven by the excitation scan.
///
/// This trait exists solely to enable trait objects. Implement `DeviceProxy` and
/// `ExposureControl` and get this automatically via the blanket impl.
pub trait Camera: DeviceProxy + ExposureControl + AsProxy {}

/// Blanket implementation - any type implementing both traits gets Camera for free
impl<T: DeviceProxy + ExposureControl> Camera for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::ReadingValue;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct InstantMeter {
        triggered: AtomicBool,
    }

    #[async_trait]
    impl DeviceProxy for InstantMeter {
        fn name(&self) -> &str {
            "instant"
        }

        async fn trigger_measurement(&self) -> Result<()> {
            self.triggered.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_busy(&self) -> Result<bool> {
            Ok(false)
        }

        async fn fetch_result(&self) -> Result<Reading> {
            if !self.triggered.load(Ordering::SeqCst) {
                anyhow::bail!("nothing measured yet");
            }
            Ok(Reading::new().with_scalar("power", 0.123))
        }

        async fn get_configuration(&self) -> Result<DeviceConfig> {
            Ok(DeviceConfig::new())
        }
    }

    #[tokio::test]
    async fn test_proxy_roundtrip() {
        let meter = InstantMeter {
            triggered: AtomicBool::new(false),
        };
        assert!(meter.fetch_result().await.is_err());

        meter.trigger_measurement().await.unwrap();
        assert!(!meter.is_busy().await.unwrap());
        let reading = meter.fetch_result().await.unwrap();
        assert!(matches!(reading.get("power"), Some(ReadingValue::Scalar(p)) if *p == 0.123));
    }

    #[tokio::test]
    async fn test_as_proxy_keeps_name() {
        let meter = InstantMeter {
            triggered: AtomicBool::new(false),
        };
        assert_eq!(meter.as_proxy().name(), "instant");
    }
}
