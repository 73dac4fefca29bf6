//! Network synchronization for a shared virtual tabletop.
//!
//! One participant hosts and relays; everyone else joins the host over TCP.
//!
//! - [`registry`]: message type keys and local ids
//! - [`dictionary`]: the host's id table as seen by a client
//! - [`connection`]: one socket with its reader and writer threads
//! - [`session`]: hosting, joining, dispatch and relay
//! - [`keepalive`]: the liveness poll that drives the session
//! - [`runtime`]: monitor thread and its command handle
//! - [`event`]: packet provenance and subscriber notifications

pub mod config;
pub mod connection;
pub mod dictionary;
pub mod error;
pub mod event;
pub mod keepalive;
pub mod registry;
pub mod runtime;
pub mod session;

pub use config::NetConfig;
pub use connection::{ConnId, ConnectionEndpoint, ConnectionState};
pub use dictionary::Dictionary;
pub use error::NetError;
pub use event::{NetworkEvent, NetworkStatus, SessionEvent};
pub use keepalive::KeepAliveMonitor;
pub use registry::{MessageHandler, MessageType, MessageTypeRegistry};
pub use runtime::{SessionHandle, SessionRuntime};
pub use session::SessionCoordinator;
pub use tabletop_netproto::messages::session::{PlayerInfo, RejectReason};
