use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_DEVICE_SIZE_GB: u64 = 512;
pub const DEFAULT_MIN_DIMENSION_PX: u32 = 10;
pub const DEFAULT_MIN_FILE_SIZE_BYTES: u64 = 1024;
pub const DEFAULT_MAX_ASPECT_RATIO: f64 = 10.0;

/// Heuristic thresholds for device safety and artifact suspicion.
///
/// None of these values come from a standard: removable media keeps growing
/// and carving false positives vary by camera, so every threshold can be
/// overridden from a JSON policy file or the command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    #[serde(default = "default_max_device_size_gb")]
    pub max_device_size_gb: u64,
    #[serde(default = "default_min_dimension_px")]
    pub min_dimension_px: u32,
    #[serde(default = "default_min_file_size_bytes")]
    pub min_file_size_bytes: u64,
    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f64,
}

fn default_max_device_size_gb() -> u64 {
    DEFAULT_MAX_DEVICE_SIZE_GB
}

fn default_min_dimension_px() -> u32 {
    DEFAULT_MIN_DIMENSION_PX
}

fn default_min_file_size_bytes() -> u64 {
    DEFAULT_MIN_FILE_SIZE_BYTES
}

fn default_max_aspect_ratio() -> f64 {
    DEFAULT_MAX_ASPECT_RATIO
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_device_size_gb: default_max_device_size_gb(),
            min_dimension_px: default_min_dimension_px(),
            min_file_size_bytes: default_min_file_size_bytes(),
            max_aspect_ratio: default_max_aspect_ratio(),
        }
    }
}

impl RecoveryPolicy {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        let policy: RecoveryPolicy = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_device_size_gb == 0 {
            anyhow::bail!("max_device_size_gb must be greater than zero");
        }
        if self.max_aspect_ratio.is_nan() || self.max_aspect_ratio < 1.0 {
            anyhow::bail!("max_aspect_ratio must be at least 1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RecoveryPolicy;

    #[test]
    fn partial_policy_file_keeps_defaults() {
        let policy: RecoveryPolicy =
            serde_json::from_str(r#"{ "max_device_size_gb": 2048 }"#).expect("policy parses");
        assert_eq!(policy.max_device_size_gb, 2048);
        assert_eq!(policy.min_dimension_px, 10);
        assert_eq!(policy.min_file_size_bytes, 1024);
        assert_eq!(policy.max_aspect_ratio, 10.0);
    }

    #[test]
    fn rejects_degenerate_thresholds() {
        let policy = RecoveryPolicy {
            max_aspect_ratio: 0.5,
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RecoveryPolicy {
            max_aspect_ratio: f64::NAN,
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = RecoveryPolicy {
            max_aspect_ratio: 1.0,
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_ok());

        let policy = RecoveryPolicy {
            max_device_size_gb: 0,
            ..RecoveryPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn loads_policy_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("policy.json");
        std::fs::write(&path, r#"{ "min_file_size_bytes": 4096 }"#).expect("write policy");

        let policy = RecoveryPolicy::load(&path).expect("policy loads");
        assert_eq!(policy.min_file_size_bytes, 4096);
        assert_eq!(policy.max_device_size_gb, 512);
    }
}
