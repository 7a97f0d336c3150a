//! Wire protocol between a host and an extension process.
//!
//! The host writes [`HostMessage`] frames to the child's stdin and reads
//! [`ExtensionMessage`] frames from its stdout. The first frame the extension
//! writes is always its [`HandshakeHeader`].
//!
//! ```text
//!  host                                   extension
//!   │  ◄──────────── Handshake ─────────────  │
//!   │  ── Request{id, Call{broker, ..}} ───►  │
//!   │  ◄── MemoryRequest{mid, broker, ..} ──  │   (zero or more)
//!   │  ── MemoryReply{mid, ..} ────────────►  │
//!   │  ◄──────── Response{id, Call} ────────  │
//! ```

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::definition::{ExtensionMeta, FunctionDefinition};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Shared secret both sides must agree on.
pub const MAGIC: &str = "orbit-satellite:9c1e4b7a2f";

/// Environment variable through which the host hands the magic to the child.
pub const MAGIC_ENV: &str = "ORBIT_EXTENSION_MAGIC";

/// Largest number of bytes moved by one memory request. Longer transfers are
/// split by the client and truncated by the server.
pub const MAX_TRANSFER_SIZE: usize = 4 * 1024 * 1024;

/// Header exchanged before any call is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Protocol version of the sender.
    pub protocol_version: u32,
    /// Shared secret of the sender.
    pub magic: String,
}

impl HandshakeHeader {
    /// The header this build sends and expects.
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            magic: MAGIC.to_string(),
        }
    }

    /// Validate a received header against the compiled-in values.
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.protocol_version,
            });
        }
        if self.magic != MAGIC {
            return Err(HandshakeError::MagicMismatch);
        }
        Ok(())
    }
}

/// Reasons a handshake header is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this build speaks.
        expected: u32,
        /// Version the peer announced.
        actual: u32,
    },

    /// The peer does not know the shared secret.
    #[error("magic value mismatch")]
    MagicMismatch,
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Single-use token naming the memory channel opened for one call.
    BrokerId
);

id_type!(
    /// Identifies one bound guest instance within an extension connection.
    InstanceId
);

/// Frames written by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostMessage {
    /// A request awaiting a [`Response`] with the same id.
    Request {
        /// Correlation id.
        id: u64,
        /// The request body.
        request: Request,
    },
    /// Answer to an extension's [`MemoryRequest`].
    MemoryReply {
        /// Id of the memory request being answered.
        id: u64,
        /// The reply body.
        reply: MemoryReply,
    },
}

/// Requests the host issues to the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// List every exported function.
    Symbols,
    /// Describe the extension.
    Meta,
    /// A guest instance starts using the extension.
    Attach {
        /// The instance.
        instance: InstanceId,
    },
    /// A guest instance stops using the extension; release its state.
    Release {
        /// The instance.
        instance: InstanceId,
    },
    /// Invoke an exported function.
    Call(CallEnvelope),
}

/// One function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Exported function name.
    pub function: String,
    /// Broker to address memory requests made while serving this call.
    pub broker: BrokerId,
    /// The calling guest instance.
    pub instance: InstanceId,
    /// Encoded arguments.
    pub inputs: Vec<u64>,
}

/// Frames written by the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExtensionMessage {
    /// The first frame of every connection.
    Handshake(HandshakeHeader),
    /// Answer to a host [`Request`].
    Response {
        /// Correlation id of the request.
        id: u64,
        /// The response body.
        response: Response,
    },
    /// Access to the memory of the guest instance behind `broker`.
    MemoryRequest {
        /// Correlation id of this memory request.
        id: u64,
        /// Broker of the call being served.
        broker: BrokerId,
        /// The request body.
        request: MemoryRequest,
    },
}

/// Responses the extension sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Every exported function.
    Symbols(Vec<FunctionDefinition>),
    /// Extension metadata.
    Meta(ExtensionMeta),
    /// Acknowledges `Attach` and `Release`.
    Ack,
    /// Encoded results of a call.
    Call {
        /// Encoded result values.
        outputs: Vec<u64>,
    },
    /// The request failed inside the extension.
    Error(RemoteError),
}

/// Failures reported by the extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RemoteError {
    /// No export with that name.
    #[error("function not exported: {0}")]
    FunctionNotExported(String),

    /// The number of inputs does not match the export's parameters.
    #[error("function '{function}' expects {expected} arguments, got {actual}")]
    ArgumentMismatch {
        /// Function name.
        function: String,
        /// Declared parameter count.
        expected: usize,
        /// Received input count.
        actual: usize,
    },

    /// The handler returned an error or panicked.
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// Memory operations on the calling guest instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryRequest {
    /// Read `size` bytes at `offset`.
    Read {
        /// Start offset.
        offset: u32,
        /// Number of bytes requested.
        size: u32,
    },
    /// Write `data` at `offset`.
    Write {
        /// Start offset.
        offset: u32,
        /// Bytes to write.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

impl MemoryRequest {
    /// A reply of the matching kind that transferred nothing.
    pub fn failed(&self, status: IoStatus) -> MemoryReply {
        match self {
            MemoryRequest::Read { .. } => MemoryReply::Read {
                data: Vec::new(),
                status,
            },
            MemoryRequest::Write { .. } => MemoryReply::Write { written: 0, status },
        }
    }
}

/// Results of a [`MemoryRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryReply {
    /// Bytes read, possibly fewer than requested.
    Read {
        /// The bytes read.
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        /// Status of the read.
        status: IoStatus,
    },
    /// Number of bytes written.
    Write {
        /// Bytes actually written.
        written: u32,
        /// Status of the write.
        status: IoStatus,
    },
}

/// Byte payloads travel as base64 strings rather than JSON number arrays.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// I/O status attached to memory replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoStatus {
    /// The operation completed in full.
    None,
    /// Fewer bytes were written than supplied.
    ShortWrite,
    /// A buffer was too small for the encoded data.
    ShortBuffer,
    /// The end of guest memory was reached.
    Eof,
    /// Nothing could be transferred.
    NoProgress,
    /// Any other failure.
    Other,
}

impl IoStatus {
    /// Whether the status reports a complete operation.
    pub fn is_ok(self) -> bool {
        self == IoStatus::None
    }

    /// Convert into the equivalent `std::io::Error`, if any.
    pub fn into_io_error(self) -> Option<io::Error> {
        let (kind, message) = match self {
            IoStatus::None => return None,
            IoStatus::ShortWrite => (io::ErrorKind::WriteZero, "short write"),
            IoStatus::ShortBuffer => (io::ErrorKind::InvalidData, "short buffer"),
            IoStatus::Eof => (io::ErrorKind::UnexpectedEof, "end of guest memory"),
            IoStatus::NoProgress => (io::ErrorKind::Other, "no progress"),
            IoStatus::Other => (io::ErrorKind::Other, "memory access failed"),
        };
        Some(io::Error::new(kind, message))
    }

    /// Classify an `std::io::Error`.
    pub fn from_io_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WriteZero => IoStatus::ShortWrite,
            io::ErrorKind::InvalidData => IoStatus::ShortBuffer,
            io::ErrorKind::UnexpectedEof => IoStatus::Eof,
            _ => IoStatus::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_validation() {
        assert!(HandshakeHeader::current().validate().is_ok());

        let wrong_version = HandshakeHeader {
            protocol_version: PROTOCOL_VERSION + 1,
            magic: MAGIC.to_string(),
        };
        assert_eq!(
            wrong_version.validate(),
            Err(HandshakeError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: PROTOCOL_VERSION + 1,
            })
        );

        let wrong_magic = HandshakeHeader {
            protocol_version: PROTOCOL_VERSION,
            magic: "not-an-extension".to_string(),
        };
        assert_eq!(wrong_magic.validate(), Err(HandshakeError::MagicMismatch));
    }

    #[test]
    fn test_io_status_mapping() {
        assert!(IoStatus::None.into_io_error().is_none());
        for status in [IoStatus::ShortWrite, IoStatus::ShortBuffer, IoStatus::Eof] {
            let err = status.into_io_error().unwrap();
            assert_eq!(IoStatus::from_io_error(&err), status);
        }
        let err = IoStatus::NoProgress.into_io_error().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_message_serialization() {
        let msg = HostMessage::Request {
            id: 9,
            request: Request::Call(CallEnvelope {
                function: "add".to_string(),
                broker: BrokerId(3),
                instance: InstanceId(1),
                inputs: vec![5, u64::MAX],
            }),
        };
        let json = serde_json::to_vec(&msg).unwrap();
        let back: HostMessage = serde_json::from_slice(&json).unwrap();
        match back {
            HostMessage::Request {
                id,
                request: Request::Call(call),
            } => {
                assert_eq!(id, 9);
                assert_eq!(call.broker, BrokerId(3));
                assert_eq!(call.inputs, vec![5, u64::MAX]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_memory_payload_is_compact() {
        let data = vec![0xffu8; 3 * 1024];
        let msg = HostMessage::MemoryReply {
            id: 1,
            reply: MemoryReply::Read {
                data: data.clone(),
                status: IoStatus::None,
            },
        };
        let json = serde_json::to_vec(&msg).unwrap();
        assert!(json.len() < data.len() * 2, "{} bytes", json.len());

        match serde_json::from_slice::<HostMessage>(&json).unwrap() {
            HostMessage::MemoryReply {
                reply: MemoryReply::Read { data: back, .. },
                ..
            } => assert_eq!(back, data),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_largest_transfer_fits_a_frame() {
        let msg = ExtensionMessage::MemoryRequest {
            id: u64::MAX,
            broker: BrokerId(u64::MAX),
            request: MemoryRequest::Write {
                offset: u32::MAX,
                data: vec![0xff; MAX_TRANSFER_SIZE],
            },
        };
        let json = serde_json::to_vec(&msg).unwrap();
        assert!(json.len() < crate::MAX_FRAME_SIZE);
    }
}
