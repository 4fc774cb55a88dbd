use std::fs;
use std::io::Cursor;
use std::path::Path;

use exif::{In, Tag, Value};
use image::{ColorType, ImageFormat, ImageReader};
use tracing::{debug, Span};

use crate::context::RecoveryContext;
use crate::error::{RecoveryError, Result};
use crate::model::ImageMetadata;
use crate::policy::RecoveryPolicy;

/// Decodes candidate JPEGs and flags implausible ones using policy thresholds.
#[derive(Debug, Clone)]
pub struct ArtifactValidator {
    min_dimension_px: u32,
    min_file_size_bytes: u64,
    max_aspect_ratio: f64,
    span: Span,
}

impl ArtifactValidator {
    pub fn new(ctx: &RecoveryContext) -> Self {
        Self::with_policy(ctx.policy(), ctx.span().clone())
    }

    pub fn with_policy(policy: &RecoveryPolicy, span: Span) -> Self {
        Self {
            min_dimension_px: policy.min_dimension_px,
            min_file_size_bytes: policy.min_file_size_bytes,
            max_aspect_ratio: policy.max_aspect_ratio,
            span,
        }
    }

    /// Decode failures are a negative verdict, never an error.
    pub fn validate(&self, path: &Path) -> (bool, Option<ImageMetadata>) {
        match self.inspect(path) {
            Ok(metadata) => (true, Some(metadata)),
            Err(err) => {
                debug!(parent: &self.span, path = %path.display(), %err, "image rejected");
                (false, None)
            }
        }
    }

    pub fn inspect(&self, path: &Path) -> Result<ImageMetadata> {
        let invalid = |reason: String| RecoveryError::Validation {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = fs::read(path).map_err(|err| invalid(err.to_string()))?;
        check_structure(&bytes).map_err(|reason| invalid(reason.to_string()))?;
        let reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|err| invalid(err.to_string()))?;
        if reader.format() != Some(ImageFormat::Jpeg) {
            return Err(invalid(format!(
                "not a JPEG (detected {:?})",
                reader.format()
            )));
        }
        let decoded = reader.decode().map_err(|err| invalid(err.to_string()))?;

        let mut metadata = ImageMetadata {
            width: decoded.width(),
            height: decoded.height(),
            format: "JPEG".to_string(),
            mode: color_mode(decoded.color()).to_string(),
            size_bytes: bytes.len() as u64,
            ..ImageMetadata::default()
        };
        self.read_exif(path, &bytes, &mut metadata);
        Ok(metadata)
    }

    pub fn is_suspicious(&self, metadata: Option<&ImageMetadata>) -> bool {
        let Some(metadata) = metadata else {
            return true;
        };
        if metadata.width < self.min_dimension_px || metadata.height < self.min_dimension_px {
            return true;
        }
        if metadata.size_bytes < self.min_file_size_bytes {
            return true;
        }
        let long = metadata.width.max(metadata.height) as f64;
        let short = metadata.width.min(metadata.height).max(1) as f64;
        long / short > self.max_aspect_ratio
    }

    fn read_exif(&self, path: &Path, bytes: &[u8], metadata: &mut ImageMetadata) {
        match exif::Reader::new().read_from_container(&mut Cursor::new(bytes)) {
            Ok(exif) => {
                metadata.has_exif = true;
                let ascii = |tag: Tag| {
                    exif.get_field(tag, In::PRIMARY)
                        .and_then(|field| ascii_value(&field.value))
                };
                metadata.datetime = ascii(Tag::DateTime);
                metadata.camera_make = ascii(Tag::Make);
                metadata.camera_model = ascii(Tag::Model);
            }
            Err(err) => {
                debug!(parent: &self.span, path = %path.display(), %err, "no EXIF data");
            }
        }
    }
}

/// SOI at the start and EOI at the end, ignoring the zero padding carvers
/// add up to a sector boundary.
fn check_structure(bytes: &[u8]) -> std::result::Result<(), &'static str> {
    if bytes.len() < 4 || bytes[..3] != [0xFF, 0xD8, 0xFF] {
        return Err("missing JPEG start-of-image marker");
    }
    let end = bytes
        .iter()
        .rposition(|byte| *byte != 0)
        .map_or(0, |last| last + 1);
    if end < 4 || bytes[end - 2..end] != [0xFF, 0xD9] {
        return Err("missing JPEG end-of-image marker (truncated)");
    }
    Ok(())
}

fn ascii_value(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(parts) => parts
            .first()
            .map(|bytes| {
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .trim()
                    .to_string()
            })
            .filter(|text| !text.is_empty()),
        _ => None,
    }
}

fn color_mode(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "UNKNOWN",
    }
}
