use bytes::{BufMut, Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};

use crate::{constants::ENVELOPE_LEN, envelope::Envelope, error::ProtoError};

/// A decoded packet. `payload` shares the receive buffer, so it is cheap to
/// move across threads and to hand to a message handler.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub envelope: Envelope,
    pub payload: Bytes,
}

impl PacketView {
    pub fn type_id(&self) -> i32 {
        self.envelope.type_id
    }
}

/// Build a packet: envelope followed by whatever `write_payload` appends.
///
/// The broadcast byte is always written as 0 here; the broadcast send path
/// flips it with [`mark_broadcast`] right before transmission so that
/// point-to-point and broadcast packets share one encoder.
pub fn encode_packet<F>(type_id: i32, origin: i32, write_payload: F) -> BytesMut
where
    F: FnOnce(&mut BytesMut),
{
    let mut out = BytesMut::with_capacity(ENVELOPE_LEN + 64);
    let mut ebuf = [0u8; ENVELOPE_LEN];
    Envelope::new(type_id, origin).encode_into(&mut ebuf);
    out.put_slice(&ebuf);
    write_payload(&mut out);
    out
}

/// Encode a serde payload with postcard behind the envelope.
pub fn encode_message<T: Serialize>(
    type_id: i32,
    origin: i32,
    message: &T,
) -> Result<BytesMut, ProtoError> {
    let payload = postcard::to_stdvec(message)?;
    Ok(encode_packet(type_id, origin, |buf| {
        buf.put_slice(&payload)
    }))
}

/// Decode a postcard payload produced by [`encode_message`].
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtoError> {
    Ok(postcard::from_bytes(payload)?)
}

/// Overwrite the broadcast byte of an encoded packet with 1.
pub fn mark_broadcast(packet: &mut [u8]) {
    if let Some(flag) = packet.first_mut() {
        *flag = 1;
    }
}

/// Split a raw packet into envelope and payload.
///
/// Never fails because of an unknown type id; only a truncated envelope or a
/// corrupt broadcast byte is an error.
pub fn decode_packet(raw: &Bytes) -> Result<PacketView, ProtoError> {
    let (envelope, _) = Envelope::decode(raw)?;
    Ok(PacketView {
        envelope,
        payload: raw.slice(ENVELOPE_LEN..),
    })
}
