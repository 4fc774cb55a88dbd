use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::context::RecoveryContext;
use crate::error::{RecoveryError, Result};
use crate::model::{ArtifactCategory, ArtifactCounts, RecoveredArtifact};
use crate::report::{write_reports, OutputLayout};
use crate::validate::ArtifactValidator;

#[cfg(not(unix))]
const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq)]
pub struct OrganizeOutcome {
    pub artifacts: Vec<RecoveredArtifact>,
    pub copy_failures: u64,
    pub counts: ArtifactCounts,
}

/// Copies carved files into the output tree, classifies them, and writes the
/// manifest, CSV, and summary.
#[derive(Debug, Clone)]
pub struct OutputOrganizer {
    layout: OutputLayout,
    validator: ArtifactValidator,
    ctx: RecoveryContext,
}

impl OutputOrganizer {
    pub fn new(output_base: impl Into<PathBuf>, ctx: &RecoveryContext) -> Result<Self> {
        Self::with_validator(output_base, ArtifactValidator::new(ctx), ctx)
    }

    pub fn with_validator(
        output_base: impl Into<PathBuf>,
        validator: ArtifactValidator,
        ctx: &RecoveryContext,
    ) -> Result<Self> {
        let layout = OutputLayout::new(output_base);
        layout.create()?;
        Ok(Self {
            layout,
            validator,
            ctx: ctx.clone(),
        })
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn organize(&self, sources: &[PathBuf], validate: bool) -> Result<OrganizeOutcome> {
        self.organize_with_progress(sources, validate, &mut |_, _| {})
    }

    /// Sources are numbered by input position, so a failed copy leaves a gap.
    /// `progress` receives `(done, total)` after each source, copied or not.
    pub fn organize_with_progress(
        &self,
        sources: &[PathBuf],
        validate: bool,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<OrganizeOutcome> {
        let span = self.ctx.span();
        info!(parent: span, files = sources.len(), validate, "organizing recovered files");

        let mut artifacts = Vec::with_capacity(sources.len());
        let mut copy_failures = 0_u64;
        for (position, source) in sources.iter().enumerate() {
            if self.ctx.is_cancelled() {
                return Err(RecoveryError::Interrupted);
            }
            match self.organize_one(position + 1, source, validate) {
                Some(artifact) => artifacts.push(artifact),
                None => copy_failures += 1,
            }
            progress(position + 1, sources.len());
        }

        #[cfg(not(unix))]
        self.write_index(&artifacts);

        let counts = write_reports(&artifacts, &self.layout)
            .map_err(|err| RecoveryError::Report(format!("{err:#}")))?;
        info!(
            parent: span,
            total = counts.total,
            valid = counts.valid,
            suspicious = counts.suspicious,
            copy_failures,
            "organization complete"
        );
        Ok(OrganizeOutcome {
            artifacts,
            copy_failures,
            counts,
        })
    }

    fn organize_one(
        &self,
        index: usize,
        source: &Path,
        validate: bool,
    ) -> Option<RecoveredArtifact> {
        let span = self.ctx.span();
        let new_filename = format!("image_{index:05}.jpg");
        let new_path = self.layout.images.join(&new_filename);

        let size_bytes = match fs::copy(source, &new_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(parent: span, source = %source.display(), %err, "failed to copy file");
                return None;
            }
        };

        let (is_valid, metadata) = if validate {
            self.validator.validate(&new_path)
        } else {
            (false, None)
        };
        let is_suspicious = is_valid && self.validator.is_suspicious(metadata.as_ref());

        let artifact = RecoveredArtifact {
            original_path: source.to_string_lossy().to_string(),
            new_path: new_path.to_string_lossy().to_string(),
            new_filename,
            is_valid,
            is_suspicious,
            size_bytes,
            width: metadata.as_ref().map(|m| m.width),
            height: metadata.as_ref().map(|m| m.height),
            has_exif: metadata.as_ref().is_some_and(|m| m.has_exif),
            camera_make: metadata.as_ref().and_then(|m| m.camera_make.clone()),
            camera_model: metadata.as_ref().and_then(|m| m.camera_model.clone()),
            datetime: metadata.and_then(|m| m.datetime),
        };
        debug!(
            parent: span,
            file = %artifact.new_filename,
            is_valid,
            is_suspicious,
            "organized"
        );

        #[cfg(unix)]
        self.link(&artifact);
        Some(artifact)
    }

    #[cfg(unix)]
    fn category_dir(&self, category: ArtifactCategory) -> &Path {
        match category {
            ArtifactCategory::Valid => &self.layout.valid,
            ArtifactCategory::Suspicious => &self.layout.suspicious,
        }
    }

    #[cfg(unix)]
    fn link(&self, artifact: &RecoveredArtifact) {
        let target = Path::new("../../images").join(&artifact.new_filename);
        let link = self
            .category_dir(artifact.category())
            .join(&artifact.new_filename);
        if fs::symlink_metadata(&link).is_ok() {
            let _ = fs::remove_file(&link);
        }
        if let Err(err) = std::os::unix::fs::symlink(&target, &link) {
            warn!(parent: self.ctx.span(), link = %link.display(), %err, "failed to create link");
        }
    }

    #[cfg(not(unix))]
    fn write_index(&self, artifacts: &[RecoveredArtifact]) {
        let mut index = std::collections::BTreeMap::<&str, Vec<&str>>::new();
        index.insert(ArtifactCategory::Valid.dir_name(), Vec::new());
        index.insert(ArtifactCategory::Suspicious.dir_name(), Vec::new());
        for artifact in artifacts {
            index
                .entry(artifact.category().dir_name())
                .or_default()
                .push(&artifact.new_filename);
        }
        let path = self.layout.validation().join(INDEX_FILE);
        let written = serde_json::to_string_pretty(&index)
            .map_err(|err| err.to_string())
            .and_then(|payload| fs::write(&path, payload).map_err(|err| err.to_string()));
        if let Err(err) = written {
            warn!(parent: self.ctx.span(), path = %path.display(), %err, "failed to write index");
        }
    }
}
