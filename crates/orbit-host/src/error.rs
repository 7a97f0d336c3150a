//! Error types for the host side of the bridge.

use std::path::PathBuf;
use std::time::Duration;

use orbit_core::{CoreError, InstanceId};
use thiserror::Error;

/// Errors raised while loading, binding or calling an extension.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The extension binary does not exist.
    #[error("Extension binary not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The extension binary exists but cannot be executed.
    #[error("Extension binary is not executable: {}", .0.display())]
    NotExecutable(PathBuf),

    /// The child did not complete a valid handshake.
    #[error("Incompatible extension: {0}")]
    IncompatibleExtension(String),

    /// The operating system refused to start the child.
    #[error("Failed to spawn extension '{}': {source}", path.display())]
    SpawnFailed {
        /// The binary that was spawned.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The connection to the extension broke or is not established.
    #[error("Extension unreachable: {0}")]
    ExtensionUnreachable(String),

    /// The extension does not export the requested function.
    #[error("Function not exported: {0}")]
    FunctionNotExported(String),

    /// A declared type is outside the four primitive types.
    #[error("Unsupported value type: {0}")]
    UnsupportedValueType(String),

    /// The extension returned results that do not match the signature.
    #[error("Malformed return from '{function}': expected {expected} results, got {actual}")]
    MalformedReturn {
        /// Function name.
        function: String,
        /// Declared result count.
        expected: usize,
        /// Received result count.
        actual: usize,
    },

    /// Arguments do not match the function's parameters.
    #[error("Argument mismatch calling '{function}': expected ({expected}), got ({actual})")]
    ArgumentMismatch {
        /// Function name.
        function: String,
        /// Declared parameter types.
        expected: String,
        /// Supplied argument types.
        actual: String,
    },

    /// The extension did not answer within the configured call timeout.
    #[error("Call to '{function}' timed out after {timeout:?}")]
    CallTimedOut {
        /// Function name.
        function: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The handler inside the extension failed.
    #[error("Extension function '{function}' failed: {message}")]
    Remote {
        /// Function name.
        function: String,
        /// Failure reported by the extension.
        message: String,
    },

    /// The bound instance was closed.
    #[error("Instance {0} is closed")]
    InstanceClosed(InstanceId),

    /// A reload changed a signature this instance was bound against.
    #[error("Instance {instance} was invalidated by a signature change in '{function}'")]
    InstanceInvalidated {
        /// The instance.
        instance: InstanceId,
        /// The function that was called.
        function: String,
    },

    /// The extension process handle was closed.
    #[error("Extension is closed")]
    ExtensionClosed,

    /// Guest memory is not exported by the calling instance.
    #[error("Memory export 'memory' not found")]
    MemoryNotFound,

    /// Guest memory access out of bounds.
    #[error("Memory access out of bounds: offset={offset}, len={len}, memory_size={memory_size}")]
    MemoryAccessOutOfBounds {
        /// The offset attempted.
        offset: usize,
        /// The length attempted.
        len: usize,
        /// The actual memory size.
        memory_size: usize,
    },

    /// Host function registration failed.
    #[error("Failed to register function '{module}::{name}': {reason}")]
    RegistrationFailed {
        /// The import module name.
        module: String,
        /// The function name.
        name: String,
        /// The reason for failure.
        reason: String,
    },

    /// Function already registered.
    #[error("Function already registered: {module}::{name}")]
    AlreadyRegistered {
        /// The import module name.
        module: String,
        /// The function name.
        name: String,
    },

    /// The extension sent something the protocol does not allow here.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The file watcher could not be set up.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CoreError> for BridgeError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::UnsupportedValueType(ty) => BridgeError::UnsupportedValueType(ty),
            CoreError::Io(e) => BridgeError::Io(e),
            other => BridgeError::Protocol(other.to_string()),
        }
    }
}

/// Result type for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
