//! Wire layer for tabletop session synchronization.
//!
//! Everything here is transport-agnostic byte shuffling: the fixed packet
//! envelope, stream framing, the reserved message-type ids and the payloads
//! exchanged during the login/dictionary handshake. Session logic lives in
//! `tabletop-netsync`.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod messages;
pub mod msg_id;
pub mod packet;

pub use envelope::Envelope;
pub use error::ProtoError;
pub use msg_id::BuiltinId;
pub use packet::{PacketView, decode_packet, encode_packet, mark_broadcast};
