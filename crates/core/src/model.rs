use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::units::human_bytes;

/// Snapshot of a block device as reported by the device collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub path: String,
    pub raw_path: String,
    pub size_bytes: u64,
    pub filesystem: Option<String>,
    pub mount_point: Option<String>,
    pub ordinal: i64,
    pub is_internal: bool,
    pub is_removable: bool,
    pub volume_name: Option<String>,
}

impl DeviceDescriptor {
    pub fn size_human(&self) -> String {
        human_bytes(self.size_bytes)
    }

    pub fn is_mounted(&self) -> bool {
        self.mount_point
            .as_deref()
            .is_some_and(|mount| !mount.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            safe: true,
            reason: None,
        }
    }

    pub fn unsafe_because(reason: impl Into<String>) -> Self {
        Self {
            safe: false,
            reason: Some(reason.into()),
        }
    }
}

/// What a session scans: a queried device or a disk-image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTarget {
    Device(DeviceDescriptor),
    Image(PathBuf),
}

impl RecoveryTarget {
    pub fn descriptor(&self) -> Option<&DeviceDescriptor> {
        match self {
            Self::Device(descriptor) => Some(descriptor),
            Self::Image(_) => None,
        }
    }

    /// Path handed to the carving engine. Raw device nodes bypass the buffer
    /// cache and are preferred when known.
    pub fn scan_path(&self) -> String {
        match self {
            Self::Device(descriptor) if !descriptor.raw_path.is_empty() => {
                descriptor.raw_path.clone()
            }
            Self::Device(descriptor) => descriptor.path.clone(),
            Self::Image(path) => path.to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub output_dir: PathBuf,
    pub recup_dirs: Vec<PathBuf>,
    pub files_recovered: u64,
    pub recovered_files: Vec<PathBuf>,
    pub output_lines: Vec<String>,
}

/// Decoded properties of a candidate JPEG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub mode: String,
    pub size_bytes: u64,
    pub has_exif: bool,
    pub datetime: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredArtifact {
    pub original_path: String,
    pub new_path: String,
    pub new_filename: String,
    pub is_valid: bool,
    pub is_suspicious: bool,
    pub size_bytes: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub has_exif: bool,
    #[serde(default)]
    pub camera_make: Option<String>,
    #[serde(default)]
    pub camera_model: Option<String>,
    #[serde(default)]
    pub datetime: Option<String>,
}

impl RecoveredArtifact {
    pub fn category(&self) -> ArtifactCategory {
        if self.is_valid && !self.is_suspicious {
            ArtifactCategory::Valid
        } else {
            ArtifactCategory::Suspicious
        }
    }

    /// `"<make> <model>"` when both EXIF fields are present.
    pub fn camera(&self) -> Option<String> {
        match (&self.camera_make, &self.camera_model) {
            (Some(make), Some(model)) => Some(format!("{make} {model}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Valid,
    Suspicious,
}

impl ArtifactCategory {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Suspicious => "suspicious",
        }
    }
}

/// Counts shared by the manifest, CSV, and summary report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactCounts {
    pub total: u64,
    pub valid: u64,
    pub suspicious: u64,
    pub invalid: u64,
    pub with_exif: u64,
    pub total_bytes: u64,
}

impl ArtifactCounts {
    pub fn from_artifacts(artifacts: &[RecoveredArtifact]) -> Self {
        artifacts
            .iter()
            .fold(Self::default(), |mut counts, artifact| {
                counts.total += 1;
                counts.valid += u64::from(artifact.is_valid);
                counts.suspicious += u64::from(artifact.is_suspicious);
                counts.invalid += u64::from(!artifact.is_valid);
                counts.with_exif += u64::from(artifact.has_exif);
                counts.total_bytes = counts.total_bytes.saturating_add(artifact.size_bytes);
                counts
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub recovery_date: String,
    pub total_files: u64,
    pub valid_files: u64,
    pub suspicious_files: u64,
    pub files: Vec<RecoveredArtifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Validated,
    SafetyChecked,
    Confirmed,
    Prepared,
    Scanned,
    Organized,
    CleanedUp,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::CleanedUp | Self::Failed)
    }
}

/// Returned by a successful session run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub final_state: SessionState,
    pub output_dir: PathBuf,
    pub files_reported: u64,
    pub counts: ArtifactCounts,
    pub copy_failures: u64,
    pub warnings: Vec<String>,
}
