//! Access to the calling guest instance's memory.
//!
//! A [`MemoryClient`] is handed to every export handler. Its requests are
//! addressed by the broker id of the call being served, so the host answers
//! them against the memory of the instance that made the call and no other.
//!
//! Offsets are guest pointers. Integers are little-endian. Variable-sized
//! data follows the guest's two-phase pattern: the guest first asks for the
//! size (`write_*_size`), allocates, then asks for the data (`write_*`).

use std::io;
use std::sync::Arc;

use orbit_core::{BrokerId, IoStatus, MAX_TRANSFER_SIZE, MemoryReply, MemoryRequest};

/// Carries memory requests to the host and returns its replies.
pub trait MemoryTransport: Send + Sync {
    /// Send `request` on behalf of `broker` and wait for the reply.
    fn exchange(&self, broker: BrokerId, request: MemoryRequest) -> io::Result<MemoryReply>;
}

/// Reads and writes the memory of the guest instance behind one call.
#[derive(Clone)]
pub struct MemoryClient {
    broker: BrokerId,
    transport: Arc<dyn MemoryTransport>,
}

impl MemoryClient {
    /// Create a client for the call identified by `broker`.
    pub fn new(broker: BrokerId, transport: Arc<dyn MemoryTransport>) -> Self {
        Self { broker, transport }
    }

    /// The broker this client addresses.
    pub fn broker(&self) -> BrokerId {
        self.broker
    }

    /// Read up to `buf.len()` bytes at `offset`.
    ///
    /// At most [`MAX_TRANSFER_SIZE`] bytes move per request. A read crossing
    /// the end of memory is truncated and returns the number of bytes read.
    /// A read that yields nothing fails with `UnexpectedEof`.
    pub fn read_at(&self, offset: u32, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(MAX_TRANSFER_SIZE);
        let buf = &mut buf[..len];
        let size = u32::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read too large"))?;

        match self.transport.exchange(self.broker, MemoryRequest::Read { offset, size })? {
            MemoryReply::Read { data, status } => {
                if data.is_empty() {
                    return Err(status
                        .into_io_error()
                        .unwrap_or_else(|| io::ErrorKind::UnexpectedEof.into()));
                }
                if data.len() > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized read reply"));
                }
                match status {
                    IoStatus::None | IoStatus::Eof => {
                        buf[..data.len()].copy_from_slice(&data);
                        Ok(data.len())
                    }
                    other => Err(status_error(other)),
                }
            }
            MemoryReply::Write { .. } => Err(mismatched_reply()),
        }
    }

    /// Fill `buf` from `offset`.
    pub fn read_exact_at(&self, mut offset: u32, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.read_at(offset, buf)?;
            offset = advance(offset, n)?;
            buf = &mut buf[n..];
        }
        Ok(())
    }

    /// Write as much of `data` at `offset` as fits, returning the count.
    ///
    /// At most [`MAX_TRANSFER_SIZE`] bytes move per request.
    pub fn write_at(&self, offset: u32, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let len = data.len().min(MAX_TRANSFER_SIZE);
        let data = &data[..len];

        let request = MemoryRequest::Write {
            offset,
            data: data.to_vec(),
        };
        match self.transport.exchange(self.broker, request)? {
            MemoryReply::Write { written, status } => {
                let written = written as usize;
                if written > data.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized write reply"));
                }
                if written == 0 {
                    return Err(match status {
                        IoStatus::None | IoStatus::NoProgress => io::ErrorKind::WriteZero.into(),
                        other => status_error(other),
                    });
                }
                Ok(written)
            }
            MemoryReply::Read { .. } => Err(mismatched_reply()),
        }
    }

    /// Write all of `data` at `offset`.
    pub fn write_all_at(&self, mut offset: u32, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = self.write_at(offset, data)?;
            offset = advance(offset, n)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Read `len` bytes at `ptr`.
    pub fn read_bytes(&self, ptr: u32, len: u32) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.read_exact_at(ptr, &mut buf)?;
        Ok(buf)
    }

    /// Read a UTF-8 string of `len` bytes at `ptr`.
    pub fn read_string(&self, ptr: u32, len: u32) -> io::Result<String> {
        String::from_utf8(self.read_bytes(ptr, len)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write `data` at `ptr`.
    pub fn write_bytes(&self, ptr: u32, data: &[u8]) -> io::Result<()> {
        self.write_all_at(ptr, data)
    }

    /// Write the length of `data` at `ptr`.
    pub fn write_bytes_size(&self, ptr: u32, data: &[u8]) -> io::Result<()> {
        self.write_u32(ptr, encoded_len(data.len())?)
    }

    /// Write `value` at `ptr`.
    pub fn write_string(&self, ptr: u32, value: &str) -> io::Result<()> {
        self.write_bytes(ptr, value.as_bytes())
    }

    /// Write the byte length of `value` at `ptr`.
    pub fn write_string_size(&self, ptr: u32, value: &str) -> io::Result<()> {
        self.write_bytes_size(ptr, value.as_bytes())
    }

    /// Read an encoded byte-vector slice of `len` bytes at `ptr`.
    pub fn read_bytes_slice(&self, ptr: u32, len: u32) -> io::Result<Vec<Vec<u8>>> {
        decode_slice(&self.read_bytes(ptr, len)?)
    }

    /// Write `items` at `ptr` as an encoded slice.
    pub fn write_bytes_slice<T: AsRef<[u8]>>(&self, ptr: u32, items: &[T]) -> io::Result<()> {
        self.write_bytes(ptr, &encode_slice(items)?)
    }

    /// Write the encoded length of `items` at `ptr`.
    pub fn write_bytes_slice_size<T: AsRef<[u8]>>(&self, ptr: u32, items: &[T]) -> io::Result<()> {
        self.write_u32(ptr, encoded_len(slice_len(items))?)
    }

    /// Read an encoded string slice of `len` bytes at `ptr`.
    pub fn read_string_slice(&self, ptr: u32, len: u32) -> io::Result<Vec<String>> {
        self.read_bytes_slice(ptr, len)?
            .into_iter()
            .map(|item| {
                String::from_utf8(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            })
            .collect()
    }

    /// Write `items` at `ptr` as an encoded slice.
    pub fn write_string_slice<T: AsRef<str>>(&self, ptr: u32, items: &[T]) -> io::Result<()> {
        let bytes: Vec<&[u8]> = items.iter().map(|s| s.as_ref().as_bytes()).collect();
        self.write_bytes_slice(ptr, &bytes)
    }

    /// Write the encoded length of `items` at `ptr`.
    pub fn write_string_slice_size<T: AsRef<str>>(&self, ptr: u32, items: &[T]) -> io::Result<()> {
        let bytes: Vec<&[u8]> = items.iter().map(|s| s.as_ref().as_bytes()).collect();
        self.write_bytes_slice_size(ptr, &bytes)
    }
}

macro_rules! int_access {
    ($($read:ident, $write:ident, $ty:ty);* $(;)?) => {
        impl MemoryClient {
            $(
                #[doc = concat!("Read a little-endian `", stringify!($ty), "` at `ptr`.")]
                pub fn $read(&self, ptr: u32) -> io::Result<$ty> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    self.read_exact_at(ptr, &mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }

                #[doc = concat!("Write a little-endian `", stringify!($ty), "` at `ptr`.")]
                pub fn $write(&self, ptr: u32, value: $ty) -> io::Result<()> {
                    self.write_all_at(ptr, &value.to_le_bytes())
                }
            )*
        }
    };
}

int_access! {
    read_u8, write_u8, u8;
    read_u16, write_u16, u16;
    read_u32, write_u32, u32;
    read_u64, write_u64, u64;
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryClient")
            .field("broker", &self.broker)
            .finish()
    }
}

/// Encode byte vectors as a `u32` count followed by each item's `u32`
/// length and bytes.
pub fn encode_slice<T: AsRef<[u8]>>(items: &[T]) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(slice_len(items));
    out.extend_from_slice(&encoded_len(items.len())?.to_le_bytes());
    for item in items {
        let item = item.as_ref();
        out.extend_from_slice(&encoded_len(item.len())?.to_le_bytes());
        out.extend_from_slice(item);
    }
    Ok(out)
}

/// Decode the output of [`encode_slice`].
pub fn decode_slice(mut bytes: &[u8]) -> io::Result<Vec<Vec<u8>>> {
    let count = take_u32(&mut bytes)? as usize;
    let mut items = Vec::with_capacity(count.min(bytes.len() / 4));
    for _ in 0..count {
        let len = take_u32(&mut bytes)? as usize;
        if bytes.len() < len {
            return Err(short_buffer());
        }
        let (item, rest) = bytes.split_at(len);
        items.push(item.to_vec());
        bytes = rest;
    }
    Ok(items)
}

fn slice_len<T: AsRef<[u8]>>(items: &[T]) -> usize {
    4 + items.iter().map(|i| 4 + i.as_ref().len()).sum::<usize>()
}

fn take_u32(bytes: &mut &[u8]) -> io::Result<u32> {
    let current: &[u8] = *bytes;
    let Some((head, rest)) = current.split_first_chunk::<4>() else {
        return Err(short_buffer());
    };
    *bytes = rest;
    Ok(u32::from_le_bytes(*head))
}

fn encoded_len(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds u32"))
}

fn advance(offset: u32, n: usize) -> io::Result<u32> {
    u32::try_from(n)
        .ok()
        .and_then(|n| offset.checked_add(n))
        .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
}

fn short_buffer() -> io::Error {
    status_error(IoStatus::ShortBuffer)
}

fn status_error(status: IoStatus) -> io::Error {
    status
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("unexpected status"))
}

fn mismatched_reply() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "reply does not match request")
}
