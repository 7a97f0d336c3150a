//! Error types for the extension side.

use orbit_core::CoreError;
use thiserror::Error;

/// Errors raised while building the export table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    /// A declared type is not one of the four primitive value types.
    #[error("Export '{function}' declares unsupported value type '{ty}'")]
    UnsupportedValueType {
        /// The declared export name.
        function: String,
        /// The offending type name.
        ty: String,
    },

    /// Two exports resolve to the same name.
    #[error("Duplicate export: {0}")]
    DuplicateFunction(String),

    /// The export name is empty after stripping its marker.
    #[error("Invalid export name: '{0}'")]
    InvalidName(String),
}

impl ExportError {
    pub(crate) fn from_core(function: &str, err: CoreError) -> Self {
        match err {
            CoreError::UnsupportedValueType(ty) => ExportError::UnsupportedValueType {
                function: function.to_string(),
                ty,
            },
            _ => ExportError::InvalidName(function.to_string()),
        }
    }
}

/// A failure inside an export handler, reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create an error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The message sent to the host.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(format!("memory access failed: {err}"))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors that end the serve loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The process was not started by an Orbit host.
    #[error("This binary is an Orbit extension and must be launched by its host")]
    NotLaunchedByHost,

    /// The connection to the host failed.
    #[error("Connection to host failed: {0}")]
    Connection(#[from] CoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for handlers.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Result type for the serve loop.
pub type ServeResult<T> = std::result::Result<T, ServeError>;
