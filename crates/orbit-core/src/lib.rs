//! Orbit Core - shared types for out-of-process host functions
//!
//! This crate holds everything a host and an extension process must agree on:
//!
//! - [`ValueType`] and [`Value`]: the four primitive types and their 64-bit
//!   transport word encoding
//! - [`FunctionDefinition`]: the signature of one exported function
//! - [`protocol`]: handshake header and the messages exchanged over the pipe
//! - [`frame`]: the length-prefixed frame codec carrying those messages
//!
//! # Value encoding
//!
//! ```
//! use orbit_core::{Value, ValueType};
//!
//! let word = Value::I32(-1).encode();
//! assert_eq!(word, 0xffff_ffff);
//! assert_eq!(Value::decode(ValueType::I32, word), Value::I32(-1));
//! ```

pub mod definition;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod value;

// Re-export main types at crate root
pub use definition::{ExportKind, ExtensionMeta, FunctionDefinition};
pub use error::{CoreError, CoreResult};
pub use frame::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use protocol::{
    BrokerId, CallEnvelope, ExtensionMessage, HandshakeError, HandshakeHeader, HostMessage,
    InstanceId, IoStatus, MAX_TRANSFER_SIZE, MemoryReply, MemoryRequest, RemoteError, Request,
    Response,
};
pub use value::{Primitive, TypeSpec, Value, ValueType, decode_all, encode_all};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::definition::{ExtensionMeta, FunctionDefinition};
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::protocol::{BrokerId, InstanceId, IoStatus};
    pub use crate::value::{Primitive, Value, ValueType};
}
