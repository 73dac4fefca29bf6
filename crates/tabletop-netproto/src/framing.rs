//! Length-prefixed framing over a byte stream.
//!
//! TCP delivers a byte stream, not packets, so every packet write is preceded
//! by its length: `[u32 frame_len_be][Envelope][Payload]`. Readers use the
//! prefix to reassemble packets that arrive split across several reads.
//! Both functions are blocking and work with any `Read` / `Write`.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

use crate::constants::{FRAME_LEN_PREFIX, MAX_FRAME_LEN};
use crate::error::ProtoError;

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, packet: &[u8]) -> io::Result<()> {
    let len = packet.len();
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            ProtoError::FrameTooLarge(len),
        ));
    }
    let prefix = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame length overflow"))?
        .to_be_bytes();
    writer.write_all(&prefix)?;
    writer.write_all(packet)?;
    writer.flush()
}

/// Read one frame.
///
/// Returns `UnexpectedEof` if the stream ends before or inside a frame and
/// `InvalidData` if the prefix exceeds `MAX_FRAME_LEN`. Frames shorter than
/// an envelope are returned as-is; rejecting them is the decoder's job so a
/// single bad packet does not cost the connection.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Bytes> {
    let mut len_buf = [0u8; FRAME_LEN_PREFIX];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtoError::FrameTooLarge(len),
        ));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf)?;
    Ok(buf.freeze())
}
