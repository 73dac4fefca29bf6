//! Message type registry.
//!
//! Maps stable string keys (e.g. `tabletop.map.DrawStroke`) to the small
//! integer ids written on the wire. Ids 1-3 belong to the built-in types and
//! are assigned at construction; everything else gets the next id from 4 up
//! in local registration order. Because optional modules register
//! conditionally, two processes may number the same key differently, which is
//! what the dictionary handshake (`dictionary.rs`) reconciles.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tabletop_netproto::msg_id::{BuiltinId, FIRST_DYNAMIC_ID, UNKNOWN_ID_NAME};
use tracing::{debug, warn};

use crate::event::NetworkEvent;
use crate::session::SessionCoordinator;

/// Consumer of decoded payloads for one message type.
///
/// Handlers run on the monitor thread with exclusive access to the session,
/// so they may reply, broadcast or disconnect directly. Errors are logged
/// and never interrupt dispatch of later packets.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        session: &mut SessionCoordinator,
        payload: Bytes,
        event: &NetworkEvent,
    ) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&mut SessionCoordinator, Bytes, &NetworkEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(
        &self,
        session: &mut SessionCoordinator,
        payload: Bytes,
        event: &NetworkEvent,
    ) -> anyhow::Result<()> {
        self(session, payload, event)
    }
}

/// A registered message type.
#[derive(Clone)]
pub struct MessageType {
    key: String,
    id: i32,
    /// `None` for built-ins, which the session consumes itself.
    handler: Option<Arc<dyn MessageHandler>>,
}

impl MessageType {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn is_builtin(&self) -> bool {
        self.handler.is_none()
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.handler.clone()
    }
}

impl std::fmt::Debug for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageType")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("builtin", &self.is_builtin())
            .finish()
    }
}

/// Append-only key <-> id table for this process.
pub struct MessageTypeRegistry {
    by_id: BTreeMap<i32, MessageType>,
    by_key: HashMap<String, i32>,
    next_id: i32,
}

impl MessageTypeRegistry {
    /// Create a registry holding only the built-in types.
    pub fn new() -> Self {
        let mut registry = Self {
            by_id: BTreeMap::new(),
            by_key: HashMap::new(),
            next_id: FIRST_DYNAMIC_ID,
        };
        for builtin in BuiltinId::ALL {
            registry.insert(MessageType {
                key: builtin.key().to_string(),
                id: builtin.id(),
                handler: None,
            });
        }
        registry
    }

    /// Register `key` and return its id.
    ///
    /// Registering a key twice is a no-op: the first handler stays and the
    /// existing id is returned.
    pub fn register<H>(&mut self, key: impl Into<String>, handler: H) -> i32
    where
        H: MessageHandler + 'static,
    {
        let key = key.into();
        if let Some(&id) = self.by_key.get(&key) {
            warn!(%key, id, "Message type already registered; keeping the first registration");
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        debug!(%key, id, "Registered message type");
        self.insert(MessageType {
            key,
            id,
            handler: Some(Arc::new(handler)),
        });
        id
    }

    /// Closure form of [`register`](Self::register).
    pub fn register_fn<F>(&mut self, key: impl Into<String>, handler: F) -> i32
    where
        F: Fn(&mut SessionCoordinator, Bytes, &NetworkEvent) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register(key, handler)
    }

    pub fn lookup_by_id(&self, id: i32) -> Option<&MessageType> {
        self.by_id.get(&id)
    }

    pub fn lookup_by_key(&self, key: &str) -> Option<&MessageType> {
        self.by_key.get(key).and_then(|id| self.by_id.get(id))
    }

    pub fn id_of(&self, key: &str) -> Option<i32> {
        self.by_key.get(key).copied()
    }

    /// Key registered for `id`, or `"UNKNOWN_ID"`.
    ///
    /// Unknown ids are expected at runtime (a peer running a module this
    /// node lacks), so this never fails.
    pub fn lookup_name(&self, id: i32) -> &str {
        self.by_id
            .get(&id)
            .map(|t| t.key.as_str())
            .unwrap_or(UNKNOWN_ID_NAME)
    }

    /// All types in id order, built-ins first.
    pub fn entries(&self) -> impl Iterator<Item = &MessageType> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn insert(&mut self, message_type: MessageType) {
        self.by_key.insert(message_type.key.clone(), message_type.id);
        self.by_id.insert(message_type.id, message_type);
    }
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
