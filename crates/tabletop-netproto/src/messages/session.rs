use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public identity of a participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PlayerInfo {
    pub id: i32,
    pub name: String,
    pub character_name: String,
}

/// Client login, sent as the dictionary request before anything else.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub protocol_version: u32,
    pub player_name: String,
    pub character_name: String,
    /// Plaintext session password; empty when the session has none.
    pub password: String,
}

/// One row of the host's id table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub id: i32,
    pub key: String,
}

/// Why the host refused a login.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("invalid password")]
    InvalidPassword,
    #[error("protocol version mismatch (host {host}, client {client})")]
    VersionMismatch { host: u32, client: u32 },
}

/// Host-to-client control traffic on the dictionary-response id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DictionaryResponse {
    /// Login accepted. `entries` is the host's entire current id table.
    /// Re-sent with the same `player_id` when the host's table grows.
    Accepted {
        player_id: i32,
        entries: Vec<DictionaryEntry>,
        players: Vec<PlayerInfo>,
    },
    /// Login refused; the host closes the connection after sending this.
    Rejected { reason: RejectReason },
    /// Player roster after a join or departure.
    Roster { players: Vec<PlayerInfo> },
}
