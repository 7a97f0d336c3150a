//! Length-prefixed frame codec.
//!
//! Each frame is a little-endian `u32` byte length followed by a JSON
//! payload.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CoreError, CoreResult};

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Serialize `message` and write it as one frame, then flush.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> CoreResult<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and deserialize it.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> CoreResult<Option<T>> {
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_le_bytes(len) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ExtensionMessage, HandshakeHeader};
    use std::io::Cursor;

    #[test]
    fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ExtensionMessage::Handshake(HandshakeHeader::current())).unwrap();
        write_frame(&mut buf, &42u32).unwrap();

        let mut cursor = Cursor::new(buf);
        let first: ExtensionMessage = read_frame(&mut cursor).unwrap().unwrap();
        assert!(matches!(first, ExtensionMessage::Handshake(h) if h.validate().is_ok()));
        let second: u32 = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(second, 42);
        assert!(read_frame::<_, u32>(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &"hello").unwrap();
        buf.truncate(buf.len() - 2);

        let result = read_frame::<_, String>(&mut Cursor::new(buf));
        assert!(matches!(result, Err(CoreError::Io(_))));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let result = read_frame::<_, serde_json::Value>(&mut Cursor::new(buf));
        assert!(matches!(result, Err(CoreError::FrameTooLarge { .. })));
    }
}
