use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, Span};

use crate::context::RecoveryContext;
use crate::error::{RecoveryError, Result};
use crate::model::DeviceDescriptor;
use crate::units::parse_size;

static DISK_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/dev/(disk\d+)").expect("disk identifier pattern compiles"));
static DISK_ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"disk(\d+)").expect("disk ordinal pattern compiles"));
static EXACT_BYTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d+)\s+Bytes\)").expect("exact bytes pattern compiles"));

/// Queries and mount control for block devices. Only the session machine
/// mounts or unmounts.
pub trait DeviceControl {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    fn describe(&self, device_path: &str) -> Result<DeviceDescriptor>;

    fn unmount(&self, device_path: &str) -> Result<()>;

    fn mount(&self, device_path: &str) -> Result<()>;
}

/// macOS `diskutil` backed device control.
#[derive(Debug, Clone)]
pub struct Diskutil {
    program: PathBuf,
    span: Span,
}

impl Diskutil {
    pub fn new(ctx: &RecoveryContext) -> Self {
        Self::with_program(ctx, "diskutil")
    }

    pub fn with_program(ctx: &RecoveryContext, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            span: ctx.span().clone(),
        }
    }

    fn run(&self, args: &[&str]) -> std::result::Result<String, String> {
        debug!(parent: &self.span, program = %self.program.display(), ?args, "running diskutil");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|err| format!("failed to run {}: {err}", self.program.display()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Err(if stderr.is_empty() { stdout } else { stderr })
        }
    }
}

impl DeviceControl for Diskutil {
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let listing = self.run(&["list"]).map_err(|err| {
            RecoveryError::DeviceNotFound(format!("failed to list devices: {err}"))
        })?;

        let mut devices = Vec::new();
        for device_path in parse_disk_list(&listing) {
            match self.describe(&device_path) {
                Ok(descriptor) => devices.push(descriptor),
                Err(err) => debug!(parent: &self.span, %device_path, %err, "skipping device"),
            }
        }
        Ok(devices)
    }

    fn describe(&self, device_path: &str) -> Result<DeviceDescriptor> {
        let info = self.run(&["info", device_path]).map_err(|err| {
            RecoveryError::DeviceNotFound(format!("{device_path} ({err})"))
        })?;
        Ok(parse_disk_info(device_path, &info))
    }

    fn unmount(&self, device_path: &str) -> Result<()> {
        info!(parent: &self.span, %device_path, "unmounting device");
        self.run(&["unmountDisk", device_path]).map_err(|err| {
            RecoveryError::MountFailed(format!("failed to unmount {device_path}: {err}"))
        })?;
        info!(parent: &self.span, %device_path, "device unmounted");
        Ok(())
    }

    fn mount(&self, device_path: &str) -> Result<()> {
        info!(parent: &self.span, %device_path, "mounting device");
        match self.run(&["mountDisk", device_path]) {
            Ok(_) => {
                info!(parent: &self.span, %device_path, "device mounted");
                Ok(())
            }
            Err(err) if err.to_lowercase().contains("already mounted") => {
                info!(parent: &self.span, %device_path, "device already mounted");
                Ok(())
            }
            Err(err) => Err(RecoveryError::MountFailed(format!(
                "failed to mount {device_path}: {err}"
            ))),
        }
    }
}

/// Whole-disk paths (`/dev/diskN`) in order of first appearance.
pub fn parse_disk_list(listing: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    DISK_IDENTIFIER
        .captures_iter(listing)
        .filter_map(|captures| {
            let path = format!("/dev/{}", &captures[1]);
            seen.insert(path.clone()).then_some(path)
        })
        .collect()
}

/// Builds a descriptor from `diskutil info` `Key: Value` output.
pub fn parse_disk_info(device_path: &str, info: &str) -> DeviceDescriptor {
    let fields = info
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect::<HashMap<_, _>>();
    let field = |key: &str| {
        fields
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    };

    let ordinal = DISK_ORDINAL
        .captures(device_path)
        .and_then(|captures| captures[1].parse::<i64>().ok())
        .unwrap_or(-1);

    let mut is_internal =
        field("Device Location").is_some_and(|v| v.eq_ignore_ascii_case("internal"));
    let mut is_removable =
        field("Removable Media").is_some_and(|v| v.eq_ignore_ascii_case("removable"));
    if field("Protocol").is_some_and(|v| v.to_lowercase().contains("usb")) {
        is_removable = true;
        is_internal = false;
    }

    let size_bytes = field("Disk Size")
        .map(|raw| {
            EXACT_BYTES
                .captures(raw)
                .and_then(|captures| captures[1].parse::<u64>().ok())
                .unwrap_or_else(|| parse_size(raw))
        })
        .unwrap_or(0);

    DeviceDescriptor {
        path: device_path.to_string(),
        raw_path: device_path.replace("/dev/disk", "/dev/rdisk"),
        size_bytes,
        filesystem: field("File System Personality")
            .or_else(|| field("Type (Bundle)"))
            .map(str::to_string),
        mount_point: field("Mount Point").map(str::to_string),
        ordinal,
        is_internal,
        is_removable,
        volume_name: field("Volume Name").map(str::to_string),
    }
}

/// Multi-line description used by `devices` and the confirmation summary.
pub fn describe_device(descriptor: &DeviceDescriptor) -> String {
    let mut lines = vec![
        format!("Device: {}", descriptor.path),
        format!("Raw Device: {}", descriptor.raw_path),
        format!("Size: {}", descriptor.size_human()),
    ];
    if let Some(volume) = &descriptor.volume_name {
        lines.push(format!("Volume Name: {volume}"));
    }
    if let Some(filesystem) = &descriptor.filesystem {
        lines.push(format!("Filesystem: {filesystem}"));
    }
    if let Some(mount) = &descriptor.mount_point {
        lines.push(format!("Mount Point: {mount}"));
    }
    lines.push(format!(
        "Removable: {}",
        if descriptor.is_removable { "Yes" } else { "No" }
    ));
    lines.push(format!(
        "Internal: {}",
        if descriptor.is_internal { "Yes" } else { "No" }
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{describe_device, parse_disk_info, parse_disk_list};

    const SD_CARD_INFO: &str = "\
   Device Identifier:         disk4
   Device Node:               /dev/disk4
   Whole:                     Yes
   Part of Whole:             disk4
   Device / Media Name:       SD Card Reader

   Volume Name:               CARD
   Mounted:                   Yes
   Mount Point:               /Volumes/CARD

   File System Personality:   MS-DOS FAT32
   Protocol:                  USB
   Disk Size:                 31.9 GB (31914983424 Bytes) (exactly 62333952 512-Byte-Units)
   Device Location:           External
   Removable Media:           Removable
";

    const INTERNAL_INFO: &str = "\
   Device Identifier:         disk0
   Device Node:               /dev/disk0
   Content (IOContent):       GUID_partition_scheme
   Protocol:                  Apple Fabric
   Disk Size:                 500.3 GB
   Device Location:           Internal
   Removable Media:           Fixed
";

    #[test]
    fn parses_removable_card() {
        let descriptor = parse_disk_info("/dev/disk4", SD_CARD_INFO);
        assert_eq!(descriptor.raw_path, "/dev/rdisk4");
        assert_eq!(descriptor.ordinal, 4);
        assert_eq!(descriptor.size_bytes, 31_914_983_424);
        assert_eq!(descriptor.mount_point.as_deref(), Some("/Volumes/CARD"));
        assert_eq!(descriptor.volume_name.as_deref(), Some("CARD"));
        assert_eq!(descriptor.filesystem.as_deref(), Some("MS-DOS FAT32"));
        assert!(descriptor.is_removable);
        assert!(!descriptor.is_internal);
        assert!(descriptor.is_mounted());
    }

    #[test]
    fn parses_internal_disk_without_exact_bytes() {
        let descriptor = parse_disk_info("/dev/disk0", INTERNAL_INFO);
        assert_eq!(descriptor.ordinal, 0);
        assert!(descriptor.is_internal);
        assert!(!descriptor.is_removable);
        assert_eq!(descriptor.size_bytes, (500.3_f64 * (1_u64 << 30) as f64) as u64);
        assert_eq!(descriptor.mount_point, None);
        assert!(!descriptor.is_mounted());
    }

    #[test]
    fn usb_protocol_overrides_internal_location() {
        let info = "Protocol: USB\nDevice Location: Internal\nRemovable Media: Fixed\n";
        let descriptor = parse_disk_info("/dev/disk6", info);
        assert!(descriptor.is_removable);
        assert!(!descriptor.is_internal);
    }

    #[test]
    fn unknown_identifier_gets_negative_ordinal() {
        let descriptor = parse_disk_info("/dev/sdb", "");
        assert_eq!(descriptor.ordinal, -1);
        assert_eq!(descriptor.size_bytes, 0);
    }

    #[test]
    fn lists_whole_disks_once() {
        let listing = "\
/dev/disk0 (internal, physical):
   #:                       TYPE NAME                    SIZE       IDENTIFIER
   0:      GUID_partition_scheme                        *500.3 GB   disk0
/dev/disk3 (synthesized):
/dev/disk4 (external, physical):
   1:                 DOS_FAT_32 CARD                    31.9 GB    disk4s1
Physical Store /dev/disk0s2
";
        assert_eq!(
            parse_disk_list(listing),
            vec!["/dev/disk0", "/dev/disk3", "/dev/disk4"]
        );
    }

    #[test]
    fn description_includes_optional_fields() {
        let descriptor = parse_disk_info("/dev/disk4", SD_CARD_INFO);
        let text = describe_device(&descriptor);
        assert!(text.contains("Volume Name: CARD"));
        assert!(text.contains("Removable: Yes"));
        assert!(text.contains("Internal: No"));
    }
}
