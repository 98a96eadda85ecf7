//! Instrument-facing types.
//!
//! `capabilities` defines the proxy traits, `mock` provides simulated
//! instruments. The value types shared by both live here.

pub mod capabilities;
pub mod mock;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppResult, DaqError};

/// Key/value configuration reported by a device daemon.
pub type DeviceConfig = toml::Table;

/// A single image frame with 16-bit pixels, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Pixel data, `width * height` entries
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Create a frame from pixel data.
    pub fn new(width: u32, height: u32, pixels: Vec<u16>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Pixel value at (x, y), `None` outside the frame.
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    /// Mean pixel value, 0.0 for an empty frame.
    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().map(|&p| p as f64).sum::<f64>() / self.pixels.len() as f64
    }
}

/// One named value inside a [`Reading`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReadingValue {
    /// A scalar channel such as `power`.
    Scalar(f64),
    /// An image channel such as `image`.
    Image(Frame),
}

/// The values returned by one `fetch_result` call. Immutable once fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    values: BTreeMap<String, ReadingValue>,
}

impl Reading {
    /// Empty reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a scalar channel.
    pub fn with_scalar(mut self, name: &str, value: f64) -> Self {
        self.values
            .insert(name.to_string(), ReadingValue::Scalar(value));
        self
    }

    /// Builder: add an image channel.
    pub fn with_image(mut self, name: &str, frame: Frame) -> Self {
        self.values.insert(name.to_string(), ReadingValue::Image(frame));
        self
    }

    /// Raw access to a channel.
    pub fn get(&self, name: &str) -> Option<&ReadingValue> {
        self.values.get(name)
    }

    /// Scalar channel, or `MissingReadingField` if absent or not a scalar.
    pub fn scalar(&self, name: &str) -> AppResult<f64> {
        match self.values.get(name) {
            Some(ReadingValue::Scalar(v)) => Ok(*v),
            _ => Err(DaqError::MissingReadingField {
                field: name.to_string(),
                kind: "scalar",
            }),
        }
    }

    /// Take an image channel out of the reading.
    pub fn into_image(mut self, name: &str) -> AppResult<Frame> {
        match self.values.remove(name) {
            Some(ReadingValue::Image(frame)) => Ok(frame),
            _ => Err(DaqError::MissingReadingField {
                field: name.to_string(),
                kind: "image",
            }),
        }
    }
}

/// Numeric configuration value; integers are widened to f64.
pub fn config_f64(config: &DeviceConfig, key: &str) -> AppResult<f64> {
    match config.get(key) {
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(DaqError::Configuration(format!(
            "device configuration key '{key}' is not numeric: {other}"
        ))),
        None => Err(DaqError::Configuration(format!(
            "device configuration has no '{key}' entry"
        ))),
    }
}

/// Parse a daemon configuration delivered as TOML text.
pub fn parse_configuration(text: &str) -> AppResult<DeviceConfig> {
    text.parse::<DeviceConfig>().map_err(|e| {
        DaqError::Configuration(format!("unable to parse device configuration: {e}"))
    })
}
