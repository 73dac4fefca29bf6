use crate::{constants::ENVELOPE_LEN, error::ProtoError};

/// Packet envelope (wire format).
///
/// Encoding rules:
/// - Fixed size: exactly `ENVELOPE_LEN` bytes, followed by the payload.
/// - Integer fields are big-endian.
/// - Layout is defined by `encode_into()` / `decode()` offsets below.
///
/// Decode rules:
/// - Requires `buf.len() >= ENVELOPE_LEN`.
/// - Requires the broadcast byte to be 0 or 1.
/// - Does not validate `type_id`; resolving it is the dictionary's job and
///   may legitimately fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Set only by the broadcast send path, right before transmission.
    pub broadcast: bool,

    /// Message type id in the host's dictionary. 0 = unresolved.
    pub type_id: i32,

    /// Player the packet originated from (not the hop it arrived on).
    pub origin: i32,
}

impl Envelope {
    /// Envelope size in bytes for the current wire layout.
    pub const LEN: usize = ENVELOPE_LEN;

    /// Create a point-to-point envelope.
    pub fn new(type_id: i32, origin: i32) -> Self {
        Self {
            broadcast: false,
            type_id,
            origin,
        }
    }

    /// Encode this envelope into `out` using the fixed wire layout.
    ///
    /// Offsets (bytes):
    /// - 0      broadcast flag (0 or 1)
    /// - 1..5   type_id (i32 BE)
    /// - 5..9   origin (i32 BE)
    pub fn encode_into(&self, out: &mut [u8; ENVELOPE_LEN]) {
        out[0] = u8::from(self.broadcast);
        out[1..5].copy_from_slice(&self.type_id.to_be_bytes());
        out[5..9].copy_from_slice(&self.origin.to_be_bytes());
    }

    /// Decode `[Envelope][Payload]`, returning the envelope and the payload
    /// slice that follows it.
    pub fn decode(buf: &[u8]) -> Result<(Envelope, &[u8]), ProtoError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(ProtoError::TooShort);
        }

        let broadcast = match buf[0] {
            0 => false,
            1 => true,
            other => return Err(ProtoError::BadBroadcastFlag(other)),
        };
        let type_id = read_i32_be(buf, 1)?;
        let origin = read_i32_be(buf, 5)?;

        let envelope = Envelope {
            broadcast,
            type_id,
            origin,
        };
        Ok((envelope, &buf[ENVELOPE_LEN..]))
    }
}

fn read_i32_be(buf: &[u8], start: usize) -> Result<i32, ProtoError> {
    let bytes: [u8; 4] = buf
        .get(start..start + 4)
        .ok_or(ProtoError::TooShort)?
        .try_into()
        .map_err(|_| ProtoError::TooShort)?;
    Ok(i32::from_be_bytes(bytes))
}
