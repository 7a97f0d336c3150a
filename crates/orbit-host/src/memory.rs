//! Guest memory access and the per-call memory bridge.
//!
//! [`GuestMemory`] is the only view the bridge has of a guest instance's
//! linear memory. A [`MemoryBridgeServer`] exists for the duration of one
//! call and answers the extension's memory requests against the memory of
//! the instance that issued that call, and no other.

use orbit_core::{BrokerId, InstanceId, IoStatus, MAX_TRANSFER_SIZE, MemoryReply, MemoryRequest};
use tracing::trace;

use crate::error::{BridgeError, BridgeResult};

/// Read and write access to one guest instance's linear memory.
pub trait GuestMemory {
    /// Current size of the memory in bytes.
    fn len(&self) -> usize;

    /// Whether the memory is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`. The whole range must be in bounds.
    fn read(&self, offset: usize, buf: &mut [u8]) -> BridgeResult<()>;

    /// Write `data` at `offset`. The whole range must be in bounds.
    fn write(&mut self, offset: usize, data: &[u8]) -> BridgeResult<()>;
}

/// A plain byte vector acting as guest memory.
///
/// Used where no virtual machine is involved: tests, tools and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearMemory {
    bytes: Vec<u8>,
}

impl LinearMemory {
    /// Create a zeroed memory of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// Wrap existing bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// View the memory contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the underlying bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn check(&self, offset: usize, len: usize) -> BridgeResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(BridgeError::MemoryAccessOutOfBounds {
                offset,
                len,
                memory_size: self.bytes.len(),
            }),
        }
    }
}

impl GuestMemory for LinearMemory {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> BridgeResult<()> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> BridgeResult<()> {
        self.check(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

/// Serves memory requests for one outstanding call.
#[derive(Debug)]
pub struct MemoryBridgeServer {
    broker: BrokerId,
    instance: InstanceId,
    served: usize,
}

impl MemoryBridgeServer {
    /// Create a server for the call identified by `broker`.
    pub fn new(broker: BrokerId, instance: InstanceId) -> Self {
        Self {
            broker,
            instance,
            served: 0,
        }
    }

    /// The broker this server answers for.
    pub fn broker(&self) -> BrokerId {
        self.broker
    }

    /// The instance whose memory this server exposes.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Number of requests answered so far.
    pub fn served(&self) -> usize {
        self.served
    }

    /// Answer one request against `memory`.
    pub fn serve(&mut self, memory: &mut dyn GuestMemory, request: MemoryRequest) -> MemoryReply {
        self.served += 1;
        let reply = match request {
            MemoryRequest::Read { offset, size } => Self::read(memory, offset as usize, size as usize),
            MemoryRequest::Write { offset, data } => Self::write(memory, offset as usize, &data),
        };
        trace!(broker = %self.broker, instance = %self.instance, ?reply, "Served memory request");
        reply
    }

    fn read(memory: &dyn GuestMemory, offset: usize, size: usize) -> MemoryReply {
        if size == 0 {
            return MemoryReply::Read {
                data: Vec::new(),
                status: IoStatus::None,
            };
        }

        let available = memory.len().saturating_sub(offset);
        if available == 0 {
            return MemoryReply::Read {
                data: Vec::new(),
                status: IoStatus::Eof,
            };
        }

        let len = size.min(available).min(MAX_TRANSFER_SIZE);
        let mut data = vec![0u8; len];
        match memory.read(offset, &mut data) {
            Ok(()) => MemoryReply::Read {
                data,
                status: if len == available && len < size {
                    IoStatus::Eof
                } else {
                    IoStatus::None
                },
            },
            Err(_) => MemoryReply::Read {
                data: Vec::new(),
                status: IoStatus::Other,
            },
        }
    }

    fn write(memory: &mut dyn GuestMemory, offset: usize, data: &[u8]) -> MemoryReply {
        if data.is_empty() {
            return MemoryReply::Write {
                written: 0,
                status: IoStatus::None,
            };
        }

        let available = memory.len().saturating_sub(offset);
        if available == 0 {
            return MemoryReply::Write {
                written: 0,
                status: IoStatus::NoProgress,
            };
        }

        let len = data.len().min(available);
        match memory.write(offset, &data[..len]) {
            Ok(()) => MemoryReply::Write {
                written: len as u32,
                status: if len < data.len() {
                    IoStatus::ShortWrite
                } else {
                    IoStatus::None
                },
            },
            Err(_) => MemoryReply::Write {
                written: 0,
                status: IoStatus::Other,
            },
        }
    }
}
