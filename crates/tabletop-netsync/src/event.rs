//! Provenance of dispatched packets and notifications to subscribers.

use crossbeam_channel::{Receiver, Sender, unbounded};
use tabletop_netproto::messages::session::{PlayerInfo, RejectReason};

use crate::connection::ConnId;

/// Process-wide network status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkStatus {
    #[default]
    Disconnected,
    /// Joined a host and applied its dictionary.
    Connected,
    Hosting,
}

/// Where an inbound packet came from.
///
/// One is built for every dispatched packet and handed to the handler next
/// to the payload. A change applied because of a `NetworkEvent` already
/// exists on the network and must not be sent out again; collaborator code
/// typically takes `Option<&NetworkEvent>` and only broadcasts on `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    /// Connection the packet arrived on (the last hop, not the origin).
    pub conn_id: ConnId,
    /// Origin player id as written by the sender.
    pub origin_id: i32,
    /// Roster entry for `origin_id`, if the player is known.
    pub origin: Option<PlayerInfo>,
    pub broadcast: bool,
    /// Key of the message type the packet was dispatched as.
    pub message_type: String,
}

impl NetworkEvent {
    /// True if the packet claims to originate from `player_id`.
    pub fn is_from(&self, player_id: i32) -> bool {
        self.origin_id == player_id
    }
}

/// Notifications published to subscribers from the monitor tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged(NetworkStatus),
    /// Dictionary applied; the local node is now a full participant.
    ConnectionEstablished { player_id: i32 },
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerInfo),
    RosterChanged(Vec<PlayerInfo>),
    /// The host refused our login. The join attempt is over.
    LoginRejected(RejectReason),
    /// A connection went away without being closed locally.
    ConnectionLost {
        conn_id: ConnId,
        player: Option<PlayerInfo>,
        reason: String,
    },
    /// Informational, e.g. an unknown message type or a dictionary gap.
    Alert(String),
}

/// Subscriber list. Subscribers whose receiver is gone are dropped on the
/// next publish.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Vec<Sender<SessionEvent>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.senders.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }
}
