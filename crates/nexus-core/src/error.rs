use crate::resolver::ResolutionError;
use crate::transform::TransformError;
use nexus_proto::codes;
use std::path::PathBuf;
use thiserror::Error;

/// Process-level error for nexus operations.
///
/// Per-module failures never surface here during dev serving; they are
/// [`ModuleError`]s attached to the module that failed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Unsupported platform: {platform}. Nexus supports: {}", .supported.join(", "))]
    UnsupportedPlatform {
        platform: String,
        supported: Vec<String>,
    },

    #[error("Failed to load Nexus native binding {artifact}: {reason}")]
    BindingLoad { artifact: String, reason: String },

    #[error("Root directory does not exist: {0}")]
    RootNotFound(PathBuf),

    #[error("Port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("No entry module found under {root}; tried {}", .tried.join(", "))]
    NoEntry { root: PathBuf, tried: Vec<String> },

    #[error("Build failed with {} error(s):\n{}", .0.len(), render_diagnostics(.0))]
    Build(Vec<ModuleError>),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

fn render_diagnostics(errors: &[ModuleError]) -> String {
    errors
        .iter()
        .map(|e| format!("  [{}] {e}", e.code()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failure attached to a single module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Refusing to serve {path}: outside the project root")]
    OutsideRoot { path: String },
}

impl ModuleError {
    /// Stable code for wire payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Resolution(e) => e.code(),
            Self::Transform(_) => codes::TRANSFORM_FAILED,
            Self::Read { .. } => codes::MODULE_READ_FAILED,
            Self::OutsideRoot { .. } => codes::MODULE_OUTSIDE_ROOT,
        }
    }

    /// Whether the module is missing rather than broken.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Resolution(ResolutionError::NotFound { .. })
                | Self::Read { .. }
                | Self::OutsideRoot { .. }
        )
    }

    pub(crate) fn read(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
