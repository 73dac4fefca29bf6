//! Payloads of the built-in message types.
//!
//! Collaborator message types define their own payload layout; only the
//! handshake traffic on ids 1 and 2 is owned by the protocol.

pub mod session;
