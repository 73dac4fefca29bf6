//! Per-session id table negotiated with the host.
//!
//! The host's registry is authoritative: on login the host sends its whole
//! `(id, key)` table and the client swaps it in wholesale. Clients translate
//! inbound ids through this table and encode outbound packets with the host's
//! id for each key.

use std::collections::{BTreeMap, HashMap};

use tabletop_netproto::messages::session::DictionaryEntry;
use tabletop_netproto::msg_id::{BuiltinId, UNKNOWN_ID_NAME, UNRESOLVED_ID};
use tracing::{debug, warn};

use crate::registry::MessageTypeRegistry;

/// The host's full current table, built-ins included.
pub fn host_dictionary(registry: &MessageTypeRegistry) -> Vec<DictionaryEntry> {
    registry
        .entries()
        .map(|t| DictionaryEntry {
            id: t.id(),
            key: t.key().to_string(),
        })
        .collect()
}

/// Client-side view of the host's id table.
#[derive(Debug, Clone)]
pub struct Dictionary {
    by_id: BTreeMap<i32, String>,
    by_key: HashMap<String, i32>,
}

impl Dictionary {
    /// Table with only the built-ins, used until the host answers.
    pub fn new() -> Self {
        let mut by_id = BTreeMap::new();
        let mut by_key = HashMap::new();
        for builtin in BuiltinId::ALL {
            by_id.insert(builtin.id(), builtin.key().to_string());
            by_key.insert(builtin.key().to_string(), builtin.id());
        }
        Self { by_id, by_key }
    }

    /// Swap in the host's table.
    ///
    /// Both directions are rebuilt before either is replaced. Built-ins are
    /// fixed by the protocol and survive any table the host sends.
    pub fn replace(&mut self, entries: &[DictionaryEntry]) {
        let mut fresh = Self::new();
        for entry in entries {
            if entry.id == UNRESOLVED_ID {
                warn!(key = %entry.key, "Ignoring dictionary entry with id 0");
                continue;
            }
            let builtin =
                BuiltinId::from_repr(entry.id).or_else(|| BuiltinId::from_key(&entry.key));
            if let Some(builtin) = builtin {
                if builtin.id() != entry.id || builtin.key() != entry.key {
                    warn!(
                        id = entry.id,
                        key = %entry.key,
                        "Host dictionary disagrees on a built-in type"
                    );
                }
                continue;
            }
            if let Some(previous) = fresh.by_key.insert(entry.key.clone(), entry.id) {
                warn!(
                    key = %entry.key,
                    previous,
                    id = entry.id,
                    "Duplicate key in host dictionary"
                );
                fresh.by_id.remove(&previous);
            }
            if let Some(previous) = fresh.by_id.insert(entry.id, entry.key.clone()) {
                warn!(
                    id = entry.id,
                    %previous,
                    key = %entry.key,
                    "Duplicate id in host dictionary"
                );
                fresh.by_key.remove(&previous);
            }
        }
        debug!(entries = fresh.by_id.len(), "Dictionary replaced");
        *self = fresh;
    }

    /// Drop everything but the built-ins.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn key_of(&self, id: i32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn id_of(&self, key: &str) -> Option<i32> {
        self.by_key.get(key).copied()
    }

    /// Key for `id`, or `"UNKNOWN_ID"`.
    pub fn name_of(&self, id: i32) -> &str {
        self.key_of(id).unwrap_or(UNKNOWN_ID_NAME)
    }

    /// Host id to put on the wire for `key`, or `0` when the host has not
    /// told us one.
    pub fn resolve_outbound(&self, key: &str) -> i32 {
        self.id_of(key).unwrap_or(UNRESOLVED_ID)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}
