use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported when the user interrupts a session.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    UnsafeDevice,
    ToolNotFound,
    ToolExecutionFailed,
    Validation,
    MountFailed,
    Declined,
    Interrupted,
    Io,
    Report,
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device failed safety check: {reason}")]
    UnsafeDevice { device: String, reason: String },

    #[error("{0}")]
    ToolNotFound(String),

    #[error("{message}")]
    ToolExecutionFailed {
        message: String,
        exit_code: Option<i32>,
        tail: Vec<String>,
    },

    #[error("validation failed for {path}: {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("{0}")]
    MountFailed(String),

    #[error("recovery declined by user")]
    Declined,

    #[error("recovery interrupted by user")]
    Interrupted,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write report: {0}")]
    Report(String),
}

impl RecoveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::UnsafeDevice { .. } => ErrorKind::UnsafeDevice,
            Self::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Self::ToolExecutionFailed { .. } => ErrorKind::ToolExecutionFailed,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::MountFailed(_) => ErrorKind::MountFailed,
            Self::Declined => ErrorKind::Declined,
            Self::Interrupted => ErrorKind::Interrupted,
            Self::Io { .. } => ErrorKind::Io,
            Self::Report(_) => ErrorKind::Report,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Interrupted => INTERRUPTED_EXIT_CODE,
            _ => 1,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
