/// Handshake protocol version.
/// Bump this only for breaking changes to the envelope or handshake payloads.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed envelope length in bytes: broadcast flag, type id, origin player id.
pub const ENVELOPE_LEN: usize = 9;

/// Stream framing prefix length in bytes.
///
/// Each packet is framed as `[u32 frame_len_be][Envelope][Payload]`, where
/// `frame_len_be` is the length of `[Envelope][Payload]`.
pub const FRAME_LEN_PREFIX: usize = 4;

/// Maximum size of a single framed packet (envelope + payload), in bytes.
/// Full map state is echoed to late joiners as ordinary packets, so this is
/// generous; it exists to avoid unbounded allocations from a corrupt prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Player id the host always uses for itself.
pub const HOST_PLAYER_ID: i32 = 0;

/// Origin id used by a joining client before the host has assigned one.
pub const UNASSIGNED_PLAYER_ID: i32 = -1;
