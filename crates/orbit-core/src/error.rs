//! Error types shared by both sides of the bridge.

use thiserror::Error;

/// Errors raised by the value codec, function definitions and frame codec.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A declared type is not one of the four primitive value types.
    #[error("Unsupported value type: {0}")]
    UnsupportedValueType(String),

    /// A function name was empty after stripping its export marker.
    #[error("Invalid function name: '{0}'")]
    InvalidName(String),

    /// A frame announced a length above the accepted maximum.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// A frame payload could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// IO error on the underlying stream.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
