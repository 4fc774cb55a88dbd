use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::carver::{CarvingEngine, ScanRequest, DEFAULT_FILE_TYPES};
use crate::context::RecoveryContext;
use crate::device::{describe_device, DeviceControl};
use crate::error::{RecoveryError, Result};
use crate::model::{RecoveryTarget, ScanResult, SessionReport, SessionState};
use crate::organize::{OrganizeOutcome, OutputOrganizer};
use crate::safety::DeviceSafetyChecker;

/// File extensions treated as disk images rather than device nodes.
pub const IMAGE_EXTENSIONS: &[&str] = &["img", "dmg", "iso"];
const SCRATCH_PREFIX: &str = "photorec_";

/// Per-run options. Thresholds live in [`crate::policy::RecoveryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub target: String,
    pub output_dir: Option<PathBuf>,
    pub thorough: bool,
    pub validate: bool,
    pub override_safety: bool,
    pub skip_confirmation: bool,
    pub file_types: Vec<String>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            target: String::new(),
            output_dir: None,
            thorough: false,
            validate: true,
            override_safety: false,
            skip_confirmation: false,
            file_types: DEFAULT_FILE_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl RecoveryOptions {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }
}

/// `./recovered_<YYYYmmdd_HHMMSS>`
pub fn default_output_dir() -> PathBuf {
    PathBuf::from(format!("recovered_{}", Local::now().format("%Y%m%d_%H%M%S")))
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// What the user is asked to approve before anything touches the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationSummary {
    pub target: RecoveryTarget,
    pub output_dir: PathBuf,
    pub thorough: bool,
    pub validate: bool,
    pub safety_override: Option<String>,
}

impl ConfirmationSummary {
    pub fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut lines = vec![rule.clone(), "RECOVERY CONFIRMATION".to_string(), rule.clone()];
        lines.push(String::new());
        match &self.target {
            RecoveryTarget::Device(descriptor) => lines.push(describe_device(descriptor)),
            RecoveryTarget::Image(path) => lines.push(format!("Image file: {}", path.display())),
        }
        lines.push(format!("Output directory: {}", self.output_dir.display()));
        lines.push(format!("Paranoid mode: {}", enabled(self.thorough)));
        lines.push(format!("Validation: {}", enabled(self.validate)));
        lines.push(String::new());
        lines.push("This operation will:".to_string());
        lines.push("  - Read the device/image in READ-ONLY mode".to_string());
        lines.push("  - NOT modify or delete any data".to_string());
        lines.push("  - Recover deleted JPEG images".to_string());
        lines.push("  - Save recovered files to the output directory".to_string());

        if let Some(mount) = self
            .target
            .descriptor()
            .and_then(|descriptor| descriptor.mount_point.as_deref())
        {
            lines.push(String::new());
            lines.push(format!("Warning: Device is currently mounted at {mount}"));
            lines.push(
                "It will be unmounted during recovery and remounted afterward.".to_string(),
            );
        }
        if let Some(reason) = &self.safety_override {
            lines.push(String::new());
            lines.push(format!("Warning: safety check overridden: {reason}"));
        }
        lines.push(String::new());
        lines.push(rule);
        lines.join("\n")
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}

/// Obtains an explicit yes/no before the device is touched.
pub trait Confirmer {
    fn confirm(&self, summary: &ConfirmationSummary) -> bool;
}

/// Mutable rollback record for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySession {
    pub state: SessionState,
    pub target: Option<RecoveryTarget>,
    pub was_mounted: bool,
    pub temp_dir: Option<PathBuf>,
    pub warnings: Vec<String>,
    cleaned_up: bool,
}

impl Default for RecoverySession {
    fn default() -> Self {
        Self {
            state: SessionState::Created,
            target: None,
            was_mounted: false,
            temp_dir: None,
            warnings: Vec::new(),
            cleaned_up: false,
        }
    }
}

impl RecoverySession {
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up
    }
}

/// Drives one target from validation through cleanup.
///
/// Cleanup runs exactly once: at the end of [`run`](Self::run), or from `Drop`
/// if the machine is dropped before `run` finishes.
pub struct RecoverySessionMachine<'a> {
    ctx: RecoveryContext,
    options: RecoveryOptions,
    output_dir: PathBuf,
    checker: DeviceSafetyChecker,
    devices: &'a dyn DeviceControl,
    carver: &'a dyn CarvingEngine,
    confirmer: &'a dyn Confirmer,
    progress: Box<dyn FnMut(&str) + 'a>,
    file_progress: Box<dyn FnMut(usize, usize) + 'a>,
    scratch_root: PathBuf,
    session: RecoverySession,
}

impl<'a> RecoverySessionMachine<'a> {
    pub fn new(
        ctx: &RecoveryContext,
        options: RecoveryOptions,
        devices: &'a dyn DeviceControl,
        carver: &'a dyn CarvingEngine,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        Self {
            checker: DeviceSafetyChecker::from_policy(ctx.policy()),
            output_dir: options.resolved_output_dir(),
            ctx: ctx.clone(),
            options,
            devices,
            carver,
            confirmer,
            progress: Box::new(|_: &str| {}),
            file_progress: Box::new(|_: usize, _: usize| {}),
            scratch_root: env::temp_dir(),
            session: RecoverySession::default(),
        }
    }

    pub fn with_progress(mut self, progress: impl FnMut(&str) + 'a) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Called with `(done, total)` as recovered files are organized.
    pub fn with_file_progress(mut self, progress: impl FnMut(usize, usize) + 'a) -> Self {
        self.file_progress = Box::new(progress);
        self
    }

    /// Parent directory for the per-session scan scratch directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn session(&self) -> &RecoverySession {
        &self.session
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn run(&mut self) -> Result<SessionReport> {
        info!(
            parent: self.ctx.span(),
            target = %self.options.target,
            output = %self.output_dir.display(),
            "starting recovery session"
        );
        match self.drive() {
            Ok((scan, organized)) => {
                self.cleanup();
                self.transition(SessionState::CleanedUp);
                info!(
                    parent: self.ctx.span(),
                    output = %self.output_dir.display(),
                    "recovery complete"
                );
                Ok(SessionReport {
                    session_id: self.ctx.session_id().to_string(),
                    final_state: self.session.state,
                    output_dir: self.output_dir.clone(),
                    files_reported: scan.files_recovered,
                    counts: organized.counts,
                    copy_failures: organized.copy_failures,
                    warnings: self.session.warnings.clone(),
                })
            }
            Err(err) => {
                match &err {
                    RecoveryError::Interrupted => {
                        warn!(parent: self.ctx.span(), "recovery interrupted by user")
                    }
                    RecoveryError::Declined => {
                        warn!(parent: self.ctx.span(), "recovery cancelled by user")
                    }
                    other => error!(parent: self.ctx.span(), error = %other, "recovery failed"),
                }
                self.transition(SessionState::Failed);
                self.cleanup();
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<(ScanResult, OrganizeOutcome)> {
        self.checkpoint()?;
        let target = self.resolve_target()?;
        self.session.target = Some(target.clone());
        self.transition(SessionState::Validated);

        self.checkpoint()?;
        let safety_override = self.check_safety(&target)?;
        self.transition(SessionState::SafetyChecked);

        self.checkpoint()?;
        self.confirm(&target, safety_override)?;
        self.transition(SessionState::Confirmed);

        self.checkpoint()?;
        self.prepare(&target)?;
        self.transition(SessionState::Prepared);

        self.checkpoint()?;
        let scan = self.scan(&target)?;
        self.transition(SessionState::Scanned);

        self.checkpoint()?;
        let organizer = OutputOrganizer::new(&self.output_dir, &self.ctx)?;
        let organized = organizer.organize_with_progress(
            &scan.recovered_files,
            self.options.validate,
            &mut *self.file_progress,
        )?;
        self.transition(SessionState::Organized);

        Ok((scan, organized))
    }

    fn resolve_target(&self) -> Result<RecoveryTarget> {
        let raw = self.options.target.trim();
        let path = Path::new(raw);
        if is_image_path(path) && path.is_file() {
            info!(parent: self.ctx.span(), image = %path.display(), "using disk image");
            return Ok(RecoveryTarget::Image(path.to_path_buf()));
        }
        if is_image_path(path) {
            return Err(RecoveryError::DeviceNotFound(format!(
                "image file {raw} does not exist"
            )));
        }
        if !raw.starts_with("/dev/") {
            return Err(RecoveryError::DeviceNotFound(format!(
                "{raw} is not a device path"
            )));
        }
        let descriptor = self.devices.describe(raw)?;
        info!(
            parent: self.ctx.span(),
            device = %descriptor.path,
            size = %descriptor.size_human(),
            "device detected"
        );
        Ok(RecoveryTarget::Device(descriptor))
    }

    /// Returns the overridden rule, if any.
    fn check_safety(&mut self, target: &RecoveryTarget) -> Result<Option<String>> {
        let Some(descriptor) = target.descriptor() else {
            return Ok(None);
        };
        let verdict = self.checker.check(descriptor);
        if verdict.safe {
            info!(
                parent: self.ctx.span(),
                device = %descriptor.path,
                "device passed safety checks"
            );
            return Ok(None);
        }
        let reason = verdict.reason.unwrap_or_default();
        if !self.options.override_safety {
            return Err(RecoveryError::UnsafeDevice {
                device: descriptor.path.clone(),
                reason,
            });
        }
        warn!(
            parent: self.ctx.span(),
            device = %descriptor.path,
            %reason,
            "safety check overridden"
        );
        self.session
            .warnings
            .push(format!("Safety check overridden: {reason}"));
        Ok(Some(reason))
    }

    fn confirm(
        &mut self,
        target: &RecoveryTarget,
        safety_override: Option<String>,
    ) -> Result<()> {
        if self.options.skip_confirmation {
            warn!(
                parent: self.ctx.span(),
                "confirmation skipped; proceeding without user approval"
            );
            self.session
                .warnings
                .push("Confirmation was skipped".to_string());
            return Ok(());
        }
        let summary = ConfirmationSummary {
            target: target.clone(),
            output_dir: self.output_dir.clone(),
            thorough: self.options.thorough,
            validate: self.options.validate,
            safety_override,
        };
        let approved = self.confirmer.confirm(&summary);
        self.checkpoint()?;
        if approved {
            Ok(())
        } else {
            Err(RecoveryError::Declined)
        }
    }

    fn prepare(&mut self, target: &RecoveryTarget) -> Result<()> {
        let Some(descriptor) = target.descriptor() else {
            return Ok(());
        };
        if descriptor.is_mounted() {
            self.devices.unmount(&descriptor.path)?;
            self.session.was_mounted = true;
        }
        Ok(())
    }

    fn scan(&mut self, target: &RecoveryTarget) -> Result<ScanResult> {
        let scratch = self
            .scratch_root
            .join(format!("{SCRATCH_PREFIX}{}", Uuid::new_v4().simple()));
        self.session.temp_dir = Some(scratch.clone());
        fs::create_dir_all(&scratch).map_err(|err| RecoveryError::io(&scratch, err))?;
        info!(parent: self.ctx.span(), scratch = %scratch.display(), "scan scratch directory");

        let request = ScanRequest {
            target: target.scan_path(),
            output_dir: scratch,
            thorough: self.options.thorough,
            file_types: self.options.file_types.clone(),
        };
        info!(parent: self.ctx.span(), target = %request.target, "scanning");
        let result = self.carver.scan(&request, &self.ctx, &mut *self.progress)?;
        info!(
            parent: self.ctx.span(),
            files = result.files_recovered,
            "carving finished"
        );
        Ok(result)
    }

    fn checkpoint(&self) -> Result<()> {
        if self.ctx.is_cancelled() {
            Err(RecoveryError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.session.state.is_terminal() {
            return;
        }
        info!(
            parent: self.ctx.span(),
            from = ?self.session.state,
            to = ?next,
            "session transition"
        );
        self.session.state = next;
    }

    fn cleanup(&mut self) {
        if self.session.cleaned_up {
            return;
        }
        self.session.cleaned_up = true;

        if self.session.was_mounted {
            if let Some(device) = self
                .session
                .target
                .as_ref()
                .and_then(RecoveryTarget::descriptor)
                .map(|descriptor| descriptor.path.clone())
            {
                if let Err(err) = self.devices.mount(&device) {
                    warn!(
                        parent: self.ctx.span(),
                        %device,
                        error = %err,
                        "failed to remount device"
                    );
                    self.session
                        .warnings
                        .push(format!("Failed to remount {device}: {err}"));
                }
            }
        }

        if let Some(scratch) = &self.session.temp_dir {
            if scratch.exists() {
                match fs::remove_dir_all(scratch) {
                    Ok(()) => info!(
                        parent: self.ctx.span(),
                        scratch = %scratch.display(),
                        "removed scratch directory"
                    ),
                    Err(err) => warn!(
                        parent: self.ctx.span(),
                        scratch = %scratch.display(),
                        %err,
                        "could not remove scratch directory"
                    ),
                }
            }
        }
    }
}

impl Drop for RecoverySessionMachine<'_> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{default_output_dir, is_image_path, ConfirmationSummary, RecoveryOptions};
    use crate::model::{DeviceDescriptor, RecoveryTarget};

    #[test]
    fn image_extensions_are_case_insensitive() {
        assert!(is_image_path(Path::new("card.img")));
        assert!(is_image_path(Path::new("/tmp/backup.DMG")));
        assert!(is_image_path(Path::new("disc.iso")));
        assert!(!is_image_path(Path::new("/dev/disk4")));
        assert!(!is_image_path(Path::new("photo.jpg")));
    }

    #[test]
    fn options_default_to_validated_jpeg_recovery() {
        let options = RecoveryOptions::new("/dev/disk4");
        assert!(options.validate);
        assert!(!options.override_safety);
        assert!(!options.skip_confirmation);
        assert_eq!(options.file_types, vec!["jpg".to_string()]);

        let explicit = RecoveryOptions {
            output_dir: Some(PathBuf::from("out")),
            ..options
        };
        assert_eq!(explicit.resolved_output_dir(), PathBuf::from("out"));
    }

    #[test]
    fn default_output_dir_is_timestamped() {
        let name = default_output_dir().to_string_lossy().to_string();
        assert!(name.starts_with("recovered_"));
        assert_eq!(name.len(), "recovered_".len() + "YYYYmmdd_HHMMSS".len());
    }

    #[test]
    fn confirmation_warns_about_mounted_device() {
        let summary = ConfirmationSummary {
            target: RecoveryTarget::Device(DeviceDescriptor {
                path: "/dev/disk4".to_string(),
                raw_path: "/dev/rdisk4".to_string(),
                size_bytes: 32 * 1024 * 1024 * 1024,
                filesystem: None,
                mount_point: Some("/Volumes/CARD".to_string()),
                ordinal: 4,
                is_internal: false,
                is_removable: true,
                volume_name: Some("CARD".to_string()),
            }),
            output_dir: PathBuf::from("recovered"),
            thorough: true,
            validate: true,
            safety_override: None,
        };
        let text = summary.render();
        assert!(text.contains("Device: /dev/disk4"));
        assert!(text.contains("Size: 32.0 GB"));
        assert!(text.contains("Paranoid mode: Enabled"));
        assert!(text.contains("currently mounted at /Volumes/CARD"));

        let image = ConfirmationSummary {
            target: RecoveryTarget::Image(PathBuf::from("card.img")),
            thorough: false,
            ..summary
        };
        let text = image.render();
        assert!(text.contains("Image file: card.img"));
        assert!(!text.contains("currently mounted"));
    }
}
