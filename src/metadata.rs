//! Dataset metadata.
//!
//! Every dataset handed to persistence carries enough of its origin to be
//! self-describing downstream: the scan plan, every participating device's
//! configuration, and the routine's own parameters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::acquisition::plan::ScanPlan;
use crate::hardware::DeviceConfig;

/// Captures the provenance of one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMetadata {
    /// Dataset name, also the default file stem.
    pub name: String,
    /// Identifier shared by all datasets of one acquisition call.
    pub run_id: Uuid,
    /// When the acquisition started.
    pub started_at: DateTime<Utc>,
    /// The plan that generated the setpoints, if the routine sweeps.
    pub plan: Option<ScanPlan>,
    /// Configuration of the instruments used, keyed by device name.
    pub instrument_config: BTreeMap<String, DeviceConfig>,
    /// Routine parameters and derived values (cycle time, exposure, ...).
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Version of the acquisition software.
    pub software_version: String,
}

/// A builder for constructing `DatasetMetadata` instances.
pub struct MetadataBuilder {
    inner: DatasetMetadata,
}

impl MetadataBuilder {
    /// Start a new dataset description with a fresh run id.
    pub fn new(name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            inner: DatasetMetadata {
                name: name.into(),
                run_id: Uuid::new_v4(),
                started_at,
                plan: None,
                instrument_config: BTreeMap::new(),
                parameters: BTreeMap::new(),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Share the run id of a sibling dataset.
    pub fn run_id(mut self, run_id: Uuid) -> Self {
        self.inner.run_id = run_id;
        self
    }

    /// Record the scan plan.
    pub fn plan(mut self, plan: ScanPlan) -> Self {
        self.inner.plan = Some(plan);
        self
    }

    /// Record the configuration `device` reported.
    pub fn instrument(mut self, device: &str, config: DeviceConfig) -> Self {
        self.inner.instrument_config.insert(device.to_string(), config);
        self
    }

    /// Record a routine parameter or derived value.
    pub fn parameter(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.inner.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Finish the description.
    pub fn build(self) -> DatasetMetadata {
        self.inner
    }
}
