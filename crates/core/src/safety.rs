use crate::model::{DeviceDescriptor, SafetyVerdict};
use crate::policy::{RecoveryPolicy, DEFAULT_MAX_DEVICE_SIZE_GB};

const GIB: u64 = 1024 * 1024 * 1024;

/// Decides whether a device may be scanned. Pure: no I/O, no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSafetyChecker {
    max_size_gb: u64,
}

impl Default for DeviceSafetyChecker {
    fn default() -> Self {
        Self {
            max_size_gb: DEFAULT_MAX_DEVICE_SIZE_GB,
        }
    }
}

impl DeviceSafetyChecker {
    pub fn new(max_size_gb: u64) -> Self {
        Self { max_size_gb }
    }

    pub fn from_policy(policy: &RecoveryPolicy) -> Self {
        Self::new(policy.max_device_size_gb)
    }

    pub fn max_size_gb(&self) -> u64 {
        self.max_size_gb
    }

    pub fn check(&self, descriptor: &DeviceDescriptor) -> SafetyVerdict {
        evaluate(descriptor, self.max_size_gb)
    }
}

/// Rules run in order and the first violation wins.
pub fn evaluate(descriptor: &DeviceDescriptor, max_size_gb: u64) -> SafetyVerdict {
    if descriptor.ordinal <= 1 {
        return SafetyVerdict::unsafe_because(format!(
            "Device {} appears to be a primary/internal disk (disk0/disk1)",
            descriptor.path
        ));
    }

    if descriptor.is_internal {
        return SafetyVerdict::unsafe_because(format!(
            "Device {} is marked as internal",
            descriptor.path
        ));
    }

    let max_size_bytes = max_size_gb.saturating_mul(GIB);
    if descriptor.size_bytes > max_size_bytes {
        return SafetyVerdict::unsafe_because(format!(
            "Device {} is larger than expected removable media ({}GB limit, device is {})",
            descriptor.path,
            max_size_gb,
            descriptor.size_human()
        ));
    }

    if !descriptor.is_removable {
        return SafetyVerdict::unsafe_because(format!(
            "Device {} is not marked as removable",
            descriptor.path
        ));
    }

    SafetyVerdict::safe()
}
