use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use serde::Serialize;

use crate::error::RecoveryError;
use crate::model::{ArtifactCounts, Manifest, RecoveredArtifact};
use crate::units::human_bytes;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CSV_FILE: &str = "file_details.csv";
pub const SUMMARY_FILE: &str = "recovery_log.txt";

/// Directory layout created under the output base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub base: PathBuf,
    pub images: PathBuf,
    pub metadata: PathBuf,
    pub valid: PathBuf,
    pub suspicious: PathBuf,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let validation = base.join("validation");
        Self {
            images: base.join("images"),
            metadata: base.join("metadata"),
            valid: validation.join("valid"),
            suspicious: validation.join("suspicious"),
            base,
        }
    }

    pub fn validation(&self) -> PathBuf {
        self.base.join("validation")
    }

    pub fn create(&self) -> crate::error::Result<()> {
        for dir in [&self.images, &self.metadata, &self.valid, &self.suspicious] {
            fs::create_dir_all(dir).map_err(|err| RecoveryError::io(dir, err))?;
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    filename: &'a str,
    size_bytes: u64,
    size_human: String,
    is_valid: bool,
    is_suspicious: bool,
    width: Option<u32>,
    height: Option<u32>,
    has_exif: bool,
    camera_make: Option<&'a str>,
    camera_model: Option<&'a str>,
    datetime: Option<&'a str>,
    path: &'a str,
}

pub fn build_manifest(artifacts: &[RecoveredArtifact], counts: &ArtifactCounts) -> Manifest {
    Manifest {
        recovery_date: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        total_files: counts.total,
        valid_files: counts.valid,
        suspicious_files: counts.suspicious,
        files: artifacts.to_vec(),
    }
}

pub fn write_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let payload = serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write manifest to {}", path.display()))?;
    Ok(())
}

pub fn write_csv(artifacts: &[RecoveredArtifact], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for artifact in artifacts {
        writer
            .serialize(CsvRow {
                filename: &artifact.new_filename,
                size_bytes: artifact.size_bytes,
                size_human: human_bytes(artifact.size_bytes),
                is_valid: artifact.is_valid,
                is_suspicious: artifact.is_suspicious,
                width: artifact.width,
                height: artifact.height,
                has_exif: artifact.has_exif,
                camera_make: artifact.camera_make.as_deref(),
                camera_model: artifact.camera_model.as_deref(),
                datetime: artifact.datetime.as_deref(),
                path: &artifact.new_path,
            })
            .with_context(|| format!("failed to write row for {}", artifact.new_filename))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

pub fn render_summary(
    artifacts: &[RecoveredArtifact],
    counts: &ArtifactCounts,
    layout: &OutputLayout,
) -> String {
    let mut out = String::new();
    out.push_str("SD Card Image Recovery - Summary Report\n");
    out.push_str(&"=".repeat(60));
    out.push_str("\n\n");
    out.push_str(&format!(
        "Recovery Date: {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));

    out.push_str("Statistics:\n");
    out.push_str(&format!("  Total files recovered: {}\n", counts.total));
    out.push_str(&format!("  Valid files: {}\n", counts.valid));
    out.push_str(&format!("  Suspicious files: {}\n", counts.suspicious));
    out.push_str(&format!("  Invalid files: {}\n", counts.invalid));
    out.push_str(&format!("  Total size: {}\n\n", human_bytes(counts.total_bytes)));
    out.push_str(&format!("Files with EXIF data: {}\n", counts.with_exif));

    let cameras = camera_breakdown(artifacts);
    if !cameras.is_empty() {
        out.push_str("\nCamera models detected:\n");
        for (camera, count) in &cameras {
            out.push_str(&format!("  {camera}: {count} images\n"));
        }
    }

    out.push_str("\nOutput Structure:\n");
    out.push_str(&format!("  Images: {}\n", layout.images.display()));
    out.push_str(&format!("  Metadata: {}\n", layout.metadata.display()));
    out.push_str(&format!("  Valid images: {}\n", layout.valid.display()));
    out.push_str(&format!("  Suspicious images: {}\n", layout.suspicious.display()));
    out
}

pub fn write_summary(summary: &str, path: &Path) -> Result<()> {
    fs::write(path, summary)
        .with_context(|| format!("failed to write summary to {}", path.display()))?;
    Ok(())
}

/// Frequency of `"<make> <model>"` among artifacts carrying EXIF data.
pub fn camera_breakdown(artifacts: &[RecoveredArtifact]) -> BTreeMap<String, u64> {
    let mut cameras = BTreeMap::new();
    for camera in artifacts
        .iter()
        .filter(|artifact| artifact.has_exif)
        .filter_map(RecoveredArtifact::camera)
    {
        *cameras.entry(camera).or_insert(0) += 1;
    }
    cameras
}

/// Writes manifest, CSV, and summary from one shared set of counts.
pub fn write_reports(
    artifacts: &[RecoveredArtifact],
    layout: &OutputLayout,
) -> Result<ArtifactCounts> {
    let counts = ArtifactCounts::from_artifacts(artifacts);
    write_manifest(
        &build_manifest(artifacts, &counts),
        &layout.metadata.join(MANIFEST_FILE),
    )?;
    write_csv(artifacts, &layout.metadata.join(CSV_FILE))?;
    write_summary(
        &render_summary(artifacts, &counts, layout),
        &layout.metadata.join(SUMMARY_FILE),
    )?;
    Ok(counts)
}
