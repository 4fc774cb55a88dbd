pub mod carver;
pub mod context;
pub mod device;
pub mod doctor;
pub mod error;
pub mod model;
pub mod organize;
pub mod policy;
pub mod report;
pub mod safety;
pub mod session;
pub mod units;
pub mod validate;

pub use carver::{
    build_options, parse_results, CarvingEngine, Invocation, PhotoRec, ScanRequest,
    DEFAULT_FILE_TYPES,
};
pub use context::RecoveryContext;
pub use device::{describe_device, parse_disk_info, parse_disk_list, DeviceControl, Diskutil};
pub use doctor::{
    check_tool, collect_doctor_info, device_inventory, DeviceReport, DoctorInfo, ToolStatus,
};
pub use error::{ErrorKind, RecoveryError, Result, INTERRUPTED_EXIT_CODE};
pub use model::{
    ArtifactCategory, ArtifactCounts, DeviceDescriptor, ImageMetadata, Manifest,
    RecoveredArtifact, RecoveryTarget, SafetyVerdict, ScanResult, SessionReport, SessionState,
};
pub use organize::{OrganizeOutcome, OutputOrganizer};
pub use policy::RecoveryPolicy;
pub use report::{render_summary, write_reports, OutputLayout};
pub use safety::{evaluate, DeviceSafetyChecker};
pub use session::{
    default_output_dir, is_image_path, ConfirmationSummary, Confirmer, RecoveryOptions,
    RecoverySession, RecoverySessionMachine,
};
pub use units::{human_bytes, parse_size};
pub use validate::ArtifactValidator;
