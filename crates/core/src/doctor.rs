use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::carver::PhotoRec;
use crate::context::RecoveryContext;
use crate::device::DeviceControl;
use crate::error::Result;
use crate::model::{DeviceDescriptor, SafetyVerdict};
use crate::safety::DeviceSafetyChecker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub path: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorInfo {
    pub os: String,
    pub arch: String,
    pub tool: Option<ToolStatus>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device: DeviceDescriptor,
    pub verdict: SafetyVerdict,
}

pub fn check_tool(explicit: Option<&Path>, ctx: &RecoveryContext) -> Result<ToolStatus> {
    let photorec = PhotoRec::locate(explicit, ctx)?;
    let version = photorec.version()?;
    info!(parent: ctx.span(), path = %photorec.binary().display(), %version, "PhotoRec found");
    Ok(ToolStatus {
        path: photorec.binary().to_string_lossy().to_string(),
        version,
    })
}

pub fn collect_doctor_info(explicit: Option<&Path>, ctx: &RecoveryContext) -> DoctorInfo {
    let mut notes = vec![
        "Devices are only read; recovered files are written to the output directory.".to_string(),
    ];
    let tool = match check_tool(explicit, ctx) {
        Ok(status) => Some(status),
        Err(err) => {
            notes.push(err.to_string());
            None
        }
    };
    if env::consts::OS != "macos" {
        notes.push("Device discovery and mount control require macOS diskutil.".to_string());
    }

    DoctorInfo {
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
        tool,
        notes,
    }
}

/// Every discovered device with its verdict. Read-only.
pub fn device_inventory(
    devices: &dyn DeviceControl,
    checker: &DeviceSafetyChecker,
) -> Result<Vec<DeviceReport>> {
    Ok(devices
        .list_devices()?
        .into_iter()
        .map(|device| DeviceReport {
            verdict: checker.check(&device),
            device,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::path::Path;

    use super::{collect_doctor_info, device_inventory};
    use crate::context::RecoveryContext;
    use crate::device::DeviceControl;
    use crate::error::{RecoveryError, Result};
    use crate::model::DeviceDescriptor;
    use crate::safety::DeviceSafetyChecker;

    struct StaticDevices {
        mount_calls: Cell<u32>,
    }

    fn descriptor(ordinal: i64, is_removable: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            path: format!("/dev/disk{ordinal}"),
            raw_path: format!("/dev/rdisk{ordinal}"),
            size_bytes: 32 << 30,
            filesystem: None,
            mount_point: None,
            ordinal,
            is_internal: ordinal == 0,
            is_removable,
            volume_name: None,
        }
    }

    impl DeviceControl for StaticDevices {
        fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(vec![descriptor(0, false), descriptor(4, true)])
        }

        fn describe(&self, device_path: &str) -> Result<DeviceDescriptor> {
            Err(RecoveryError::DeviceNotFound(device_path.to_string()))
        }

        fn unmount(&self, _device_path: &str) -> Result<()> {
            self.mount_calls.set(self.mount_calls.get() + 1);
            Ok(())
        }

        fn mount(&self, _device_path: &str) -> Result<()> {
            self.mount_calls.set(self.mount_calls.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn inventory_pairs_devices_with_verdicts_without_side_effects() {
        let devices = StaticDevices {
            mount_calls: Cell::new(0),
        };
        let inventory =
            device_inventory(&devices, &DeviceSafetyChecker::default()).expect("inventory");
        assert_eq!(inventory.len(), 2);
        assert!(!inventory[0].verdict.safe);
        assert!(inventory[1].verdict.safe);
        assert_eq!(devices.mount_calls.get(), 0);
    }

    #[test]
    fn missing_tool_becomes_a_note() {
        let info = collect_doctor_info(
            Some(Path::new("/definitely/not/here/photorec")),
            &RecoveryContext::default(),
        );
        assert!(info.tool.is_none());
        assert!(info.notes.iter().any(|note| note.contains("not found")));
    }
}
