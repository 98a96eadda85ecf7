//! Dataset sinks.
//!
//! A sink receives a finished [`AcquisitionResult`] and a target location and
//! writes it once. JSON is always available; CSV requires the `storage_csv`
//! feature. [`MemorySink`] keeps everything in memory for tests and for callers
//! that post-process in-process.
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::StorageFormat;
use crate::data::AcquisitionResult;
use crate::error::{AppResult, DaqError};

/// Persistence collaborator for acquisition results.
#[async_trait]
pub trait DatasetSink: Send + Sync {
    /// File extension this sink writes, without the dot.
    fn extension(&self) -> &'static str;

    /// Write `result` to `location` and return the path actually written.
    async fn save(&self, result: AcquisitionResult<'_>, location: &Path) -> AppResult<PathBuf>;
}

/// Build the sink for a configured format.
pub fn sink_for(format: StorageFormat) -> AppResult<Box<dyn DatasetSink>> {
    match format {
        StorageFormat::Json => Ok(Box::new(JsonSink)),
        #[cfg(feature = "storage_csv")]
        StorageFormat::Csv => Ok(Box::new(CsvSink)),
        #[cfg(not(feature = "storage_csv"))]
        StorageFormat::Csv => Err(DaqError::Configuration(
            "CSV storage requires the storage_csv feature".to_string(),
        )),
    }
}

/// `<dir>/<stem>_power.<ext>` next to a primary dataset.
pub fn companion_path(location: &Path, suffix: &str) -> PathBuf {
    let stem = location
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}_{suffix}");
    if let Some(ext) = location.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    location.with_file_name(name)
}

fn with_extension(location: &Path, extension: &str) -> PathBuf {
    if location.extension().is_some() {
        location.to_path_buf()
    } else {
        location.with_extension(extension)
    }
}

async fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DaqError::Storage(format!("cannot create {}: {e}", parent.display())))?;
    }
    Ok(())
}

/// One pretty-printed JSON document per dataset.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

#[async_trait]
impl DatasetSink for JsonSink {
    fn extension(&self) -> &'static str {
        "json"
    }

    async fn save(&self, result: AcquisitionResult<'_>, location: &Path) -> AppResult<PathBuf> {
        let path = with_extension(location, self.extension());
        ensure_parent(&path).await?;
        let body = serde_json::to_vec_pretty(&result)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| DaqError::Storage(format!("Failed to write {}: {e}", path.display())))?;
        info!(kind = result.kind(), path = %path.display(), "Dataset saved");
        Ok(path)
    }
}

/// Metadata as `# `-prefixed JSON lines, one `# timeout: ` line per timeout
/// event, then one CSV table.
#[cfg(feature = "storage_csv")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvSink;

#[cfg(feature = "storage_csv")]
impl CsvSink {
    fn write_table(result: AcquisitionResult<'_>, path: &Path) -> AppResult<()> {
        use std::io::Write;

        let storage = |e: csv::Error| DaqError::Storage(e.to_string());
        let mut file = std::fs::File::create(path)
            .map_err(|e| DaqError::Storage(format!("Failed to create CSV file: {e}")))?;

        let header = serde_json::to_string_pretty(result.metadata())?;
        for line in header.lines() {
            writeln!(file, "# {line}")?;
        }
        for timeout in result.timeouts() {
            writeln!(file, "# timeout: {}", serde_json::to_string(timeout)?)?;
        }
        if let AcquisitionResult::PowerTrace(d) = result {
            let dark = d.dark_power.map_or("none".to_string(), |p| p.to_string());
            writeln!(file, "# dark_power: {dark}")?;
        }

        let mut writer = csv::Writer::from_writer(file);
        let opt = |v: Option<f64>| v.map_or(String::new(), |v| v.to_string());
        match result {
            AcquisitionResult::PowerSeries(d) => {
                writer.write_record(["time_s", "power"]).map_err(storage)?;
                for (t, p) in d.series.times.iter().zip(&d.series.values) {
                    writer
                        .write_record([t.to_string(), p.to_string()])
                        .map_err(storage)?;
                }
            }
            AcquisitionResult::TuningCurve(d) => {
                writer
                    .write_record(["wavelength_nm", "power", "std", "samples"])
                    .map_err(storage)?;
                for (wl, point) in d.setpoints.iter().zip(&d.points) {
                    writer
                        .write_record([
                            wl.to_string(),
                            point.mean.to_string(),
                            point.std_dev.to_string(),
                            point.samples.to_string(),
                        ])
                        .map_err(storage)?;
                }
            }
            AcquisitionResult::ImageCube(d) => {
                writer
                    .write_record(["wavelength_nm", "x", "y", "counts"])
                    .map_err(storage)?;
                let frames = d
                    .setpoints
                    .iter()
                    .map(|wl| wl.to_string())
                    .zip(&d.frames)
                    .chain(std::iter::once(("dark".to_string(), &d.dark_frame)));
                for (label, frame) in frames {
                    for (i, counts) in frame.pixels.iter().enumerate() {
                        let x = i as u32 % frame.width.max(1);
                        let y = i as u32 / frame.width.max(1);
                        writer
                            .write_record([
                                label.clone(),
                                x.to_string(),
                                y.to_string(),
                                counts.to_string(),
                            ])
                            .map_err(storage)?;
                    }
                }
            }
            AcquisitionResult::PowerTrace(d) => {
                writer
                    .write_record(["wavelength_nm", "index", "time_s", "power"])
                    .map_err(storage)?;
                for (row, wl) in d.setpoints.iter().enumerate() {
                    for col in 0..d.max_observed_length {
                        writer
                            .write_record([
                                wl.to_string(),
                                col.to_string(),
                                opt(d.times[row][col]),
                                opt(d.power[row][col]),
                            ])
                            .map_err(storage)?;
                    }
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl DatasetSink for CsvSink {
    fn extension(&self) -> &'static str {
        "csv"
    }

    async fn save(&self, result: AcquisitionResult<'_>, location: &Path) -> AppResult<PathBuf> {
        let path = with_extension(location, self.extension());
        ensure_parent(&path).await?;
        Self::write_table(result, &path)?;
        info!(kind = result.kind(), path = %path.display(), "Dataset saved");
        Ok(path)
    }
}

/// Keeps every saved dataset as a JSON document, in call order.
#[derive(Debug, Default)]
pub struct MemorySink {
    saved: Mutex<Vec<(PathBuf, serde_json::Value)>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything saved so far.
    pub async fn saved(&self) -> Vec<(PathBuf, serde_json::Value)> {
        self.saved.lock().await.clone()
    }

    /// Number of `save` calls so far.
    pub async fn save_count(&self) -> usize {
        self.saved.lock().await.len()
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    fn extension(&self) -> &'static str {
        "json"
    }

    async fn save(&self, result: AcquisitionResult<'_>, location: &Path) -> AppResult<PathBuf> {
        let path = with_extension(location, self.extension());
        let document = serde_json::to_value(result)?;
        self.saved.lock().await.push((path.clone(), document));
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        AcquisitionPhase, AggregatedPoint, PowerTrace, TimeSeries, TimeoutEvent, TuningCurve,
    };
    use crate::metadata::MetadataBuilder;

    fn curve() -> TuningCurve {
        let point = AggregatedPoint::reduce(&[1.0, 3.0]).unwrap();
        TuningCurve {
            metadata: MetadataBuilder::new("OPO-tuning-curve_test", chrono::Utc::now()).build(),
            dark_reference: AggregatedPoint::reduce(&[0.0]).unwrap(),
            setpoints: vec![450.0, 460.0],
            points: vec![point, point],
            timeouts: Vec::new(),
        }
    }

    #[test]
    fn test_companion_path() {
        assert_eq!(
            companion_path(Path::new("runs/scan.json"), "power"),
            PathBuf::from("runs/scan_power.json")
        );
        assert_eq!(
            companion_path(Path::new("scan"), "power"),
            PathBuf::from("scan_power")
        );
    }

    #[tokio::test]
    async fn test_json_sink_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = JsonSink
            .save(AcquisitionResult::TuningCurve(&curve()), &dir.path().join("nested").join("curve"))
            .await
            .unwrap();

        assert_eq!(path.extension().unwrap(), "json");
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"], "tuning_curve");
        assert_eq!(value["setpoints"][1], 460.0);
        assert_eq!(value["metadata"]["name"], "OPO-tuning-curve_test");
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = CsvSink
            .save(AcquisitionResult::TuningCurve(&curve()), &dir.path().join("curve.csv"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# {"));
        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data[0], "wavelength_nm,power,std,samples");
        assert_eq!(data[1], "450,2,1,2");
        assert_eq!(data.len(), 3);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_keeps_dark_power_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = MetadataBuilder::new("PLE-power-readings_test", chrono::Utc::now())
            .parameter("dark_reading", Some(0.987654321))
            .build();
        let series = vec![TimeSeries::default(), TimeSeries::default()];
        let timeout = TimeoutEvent {
            device: "power_meter".to_string(),
            phase: AcquisitionPhase::Sweep,
            setpoint: Some(460.0),
            elapsed_s: 0.25,
        };
        let trace = PowerTrace::from_series(
            metadata,
            vec![450.0, 460.0],
            series,
            Some(0.987654321),
            vec![timeout],
        );

        let path = CsvSink
            .save(AcquisitionResult::PowerTrace(&trace), &dir.path().join("trace.csv"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"dark_reading\": 0.987654321"));
        assert!(text.contains("# dark_power: 0.987654321"));
        let timeout_line = text
            .lines()
            .find(|l| l.starts_with("# timeout: "))
            .unwrap();
        assert!(timeout_line.contains("\"setpoint\":460.0"));
        assert!(timeout_line.contains("\"phase\":\"sweep\""));
        let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(data, vec!["wavelength_nm,index,time_s,power"]);
    }

    #[tokio::test]
    async fn test_memory_sink_records_calls() {
        let sink = MemorySink::new();
        sink.save(AcquisitionResult::TuningCurve(&curve()), Path::new("a"))
            .await
            .unwrap();
        assert_eq!(sink.save_count().await, 1);
        let (path, document) = &sink.saved().await[0];
        assert_eq!(path, &PathBuf::from("a.json"));
        assert_eq!(document["kind"], "tuning_curve");
    }
}
