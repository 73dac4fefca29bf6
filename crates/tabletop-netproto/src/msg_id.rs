use strum::FromRepr;

/// Id written by a sender that cannot translate a message type into the
/// host's dictionary. Receivers drop it.
pub const UNRESOLVED_ID: i32 = 0;

/// First id handed out to dynamically registered message types.
pub const FIRST_DYNAMIC_ID: i32 = 4;

/// Diagnostic name reported for ids with no known message type.
pub const UNKNOWN_ID_NAME: &str = "UNKNOWN_ID";

/// Message types every node knows before any negotiation happens.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum BuiltinId {
    /// Client login; asks the host for its dictionary.
    DictionaryRequest = 1,
    /// Host reply: accepted dictionary, rejection, or roster update.
    DictionaryResponse = 2,
    /// Empty heartbeat.
    KeepAlive = 3,
}

impl BuiltinId {
    pub const ALL: [BuiltinId; 3] = [
        BuiltinId::DictionaryRequest,
        BuiltinId::DictionaryResponse,
        BuiltinId::KeepAlive,
    ];

    pub const fn id(self) -> i32 {
        self as i32
    }

    /// Stable key used for this type in dictionaries.
    pub const fn key(self) -> &'static str {
        match self {
            BuiltinId::DictionaryRequest => "tabletop.net.DictionaryRequest",
            BuiltinId::DictionaryResponse => "tabletop.net.DictionaryResponse",
            BuiltinId::KeepAlive => "tabletop.net.KeepAlive",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.key() == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ids_are_locked() {
        assert_eq!(BuiltinId::DictionaryRequest.id(), 1);
        assert_eq!(BuiltinId::DictionaryResponse.id(), 2);
        assert_eq!(BuiltinId::KeepAlive.id(), 3);
        assert!(BuiltinId::ALL.iter().all(|b| b.id() < FIRST_DYNAMIC_ID));
        assert_eq!(BuiltinId::from_repr(UNRESOLVED_ID), None);
    }

    #[test]
    fn builtin_keys_resolve_back() {
        for builtin in BuiltinId::ALL {
            assert_eq!(BuiltinId::from_key(builtin.key()), Some(builtin));
        }
        assert_eq!(BuiltinId::from_key("tabletop.map.DrawStroke"), None);
    }
}
