//! Session error types.

use std::io;

use tabletop_netproto::ProtoError;
use thiserror::Error;

use crate::connection::ConnId;
use crate::event::NetworkStatus;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("session already active ({0:?})")]
    AlreadyActive(NetworkStatus),

    #[error("not connected to a session")]
    NotConnected,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("unknown player {0}")]
    UnknownPlayer(i32),

    #[error("message type not registered: {0}")]
    UnregisteredType(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("session runtime stopped")]
    RuntimeStopped,

    #[error("session runtime did not respond in time for {op}")]
    RuntimeTimeout { op: &'static str },
}
