//! Session state machine: hosting, joining, dispatch and relay.
//!
//! The coordinator is single-owner. It is either driven directly (tests,
//! embedding) or moved into the monitor thread by
//! [`SessionRuntime`](crate::runtime::SessionRuntime). Socket threads never
//! touch it; they only fill the per-connection queues drained by `tick`.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tabletop_netproto::constants::{HOST_PLAYER_ID, PROTOCOL_VERSION, UNASSIGNED_PLAYER_ID};
use tabletop_netproto::messages::session::{
    DictionaryResponse, Login, PlayerInfo, RejectReason,
};
use tabletop_netproto::msg_id::{BuiltinId, UNRESOLVED_ID};
use tabletop_netproto::packet::{decode_message, encode_message};
use tabletop_netproto::{PacketView, decode_packet, encode_packet, mark_broadcast};
use tracing::{debug, error, info, warn};

use crate::config::NetConfig;
use crate::connection::{ConnId, ConnectionEndpoint};
use crate::dictionary::{Dictionary, host_dictionary};
use crate::error::NetError;
use crate::event::{NetworkEvent, NetworkStatus, SessionEvent, Subscribers};
use crate::keepalive::KeepAliveMonitor;
use crate::registry::{MessageHandler, MessageTypeRegistry};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub(crate) struct PeerConn {
    pub(crate) endpoint: ConnectionEndpoint,
    /// Set once the login has been accepted.
    pub(crate) player: Option<PlayerInfo>,
}

pub(crate) struct Listener {
    addr: SocketAddr,
    keep_running: Arc<AtomicBool>,
    pub(crate) accepted: Receiver<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        // Accepted but never adopted.
        for stream in self.accepted.try_iter() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(addr = %self.addr, "Listener stopped");
    }
}

pub struct SessionCoordinator {
    pub(crate) config: NetConfig,
    status: NetworkStatus,
    /// Uplink open (or opening) but the host's dictionary not yet applied.
    joining: bool,
    registry: MessageTypeRegistry,
    dictionary: Dictionary,
    local_player_id: i32,
    players: BTreeMap<i32, PlayerInfo>,
    pub(crate) peers: BTreeMap<ConnId, PeerConn>,
    pub(crate) uplink: Option<ConnectionEndpoint>,
    pub(crate) listener: Option<Listener>,
    next_player_id: i32,
    pub(crate) monitor: KeepAliveMonitor,
    subscribers: Subscribers,
}

impl SessionCoordinator {
    pub fn new(config: NetConfig) -> Self {
        let monitor = KeepAliveMonitor::from_config(&config);
        Self {
            config,
            status: NetworkStatus::Disconnected,
            joining: false,
            registry: MessageTypeRegistry::new(),
            dictionary: Dictionary::new(),
            local_player_id: UNASSIGNED_PLAYER_ID,
            players: BTreeMap::new(),
            peers: BTreeMap::new(),
            uplink: None,
            listener: None,
            next_player_id: HOST_PLAYER_ID + 1,
            monitor,
            subscribers: Subscribers::default(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
    }

    /// True between `connect` and the host's dictionary response.
    pub fn is_joining(&self) -> bool {
        self.joining
    }

    /// `-1` until a player id has been assigned.
    pub fn local_player_id(&self) -> i32 {
        self.local_player_id
    }

    /// Current roster in player id order.
    pub fn players(&self) -> Vec<PlayerInfo> {
        self.players.values().cloned().collect()
    }

    pub fn player(&self, player_id: i32) -> Option<&PlayerInfo> {
        self.players.get(&player_id)
    }

    /// Open connections: every accepted socket when hosting, the uplink
    /// when joined.
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.peers
            .keys()
            .copied()
            .chain(self.uplink.as_ref().map(ConnectionEndpoint::id))
            .collect()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.addr)
    }

    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dictionary
    }

    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let rx = self.subscribers.subscribe();
        debug!(subscribers = self.subscribers.len(), "Subscriber added");
        rx
    }

    pub(crate) fn publish(&mut self, event: SessionEvent) {
        self.subscribers.publish(event);
    }

    /// Register a message type. A host that is already serving clients
    /// pushes its grown dictionary to them.
    pub fn register<H>(&mut self, key: impl Into<String>, handler: H) -> i32
    where
        H: MessageHandler + 'static,
    {
        let before = self.registry.len();
        let id = self.registry.register(key, handler);
        if self.status == NetworkStatus::Hosting && self.registry.len() > before {
            self.push_dictionary();
        }
        id
    }

    pub fn register_fn<F>(&mut self, key: impl Into<String>, handler: F) -> i32
    where
        F: Fn(&mut SessionCoordinator, Bytes, &NetworkEvent) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register(key, handler)
    }

    /// Diagnostic name for an inbound id as this node would resolve it.
    pub fn lookup_name(&self, type_id: i32) -> &str {
        if self.is_client() {
            self.dictionary.name_of(type_id)
        } else {
            self.registry.lookup_name(type_id)
        }
    }

    /// Connect or host according to the configuration.
    pub fn start(&mut self) -> Result<(), NetError> {
        if self.config.host {
            self.start_hosting(self.config.port).map(|_| ())
        } else {
            let address = self.config.address.clone();
            self.connect(&address, self.config.port)
        }
    }

    /// Open the listen socket and start accepting. Port `0` picks a free
    /// port; the bound address is returned.
    pub fn start_hosting(&mut self, port: u16) -> Result<SocketAddr, NetError> {
        self.ensure_idle()?;

        let addr = format!("{}:{}", self.config.listen_address, port);
        let listener = TcpListener::bind(&addr).map_err(|source| NetError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = unbounded();
        let flag = Arc::clone(&keep_running);
        let thread = thread::Builder::new()
            .name("net-accept".into())
            .spawn(move || accept_loop(listener, flag, tx))?;

        self.listener = Some(Listener {
            addr: local,
            keep_running,
            accepted: rx,
            thread: Some(thread),
        });
        self.dictionary.clear();
        self.local_player_id = HOST_PLAYER_ID;
        self.next_player_id = HOST_PLAYER_ID + 1;
        let me = self.local_player();
        self.players.clear();
        self.players.insert(HOST_PLAYER_ID, me);
        self.monitor.reset();
        info!(addr = %local, "Hosting session");
        self.set_status(NetworkStatus::Hosting);
        Ok(local)
    }

    /// Open the uplink and queue the login. Status stays `Disconnected`
    /// until the host's dictionary response has been applied.
    pub fn connect(&mut self, address: &str, port: u16) -> Result<(), NetError> {
        self.ensure_idle()?;

        let endpoint = ConnectionEndpoint::connect(format!("{address}:{port}"))?;
        let login = Login {
            protocol_version: PROTOCOL_VERSION,
            player_name: self.config.player_name.clone(),
            character_name: self.config.character_name.clone(),
            password: self.config.password.clone(),
        };
        let packet = encode_message(
            BuiltinId::DictionaryRequest.id(),
            UNASSIGNED_PLAYER_ID,
            &login,
        )?;
        endpoint.try_send(packet.freeze())?;

        info!(conn_id = endpoint.id(), %address, port, "Joining session");
        self.uplink = Some(endpoint);
        self.joining = true;
        self.dictionary.clear();
        self.monitor.reset();
        Ok(())
    }

    /// Build a packet for a registered type with the id the current session
    /// expects.
    ///
    /// A client whose host never registered `key` still gets a packet, sent
    /// with id `0`, and an alert is raised.
    pub fn encode<F>(&mut self, key: &str, write_payload: F) -> Result<BytesMut, NetError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let type_id = self.outbound_id(key)?;
        Ok(encode_packet(type_id, self.local_player_id, write_payload))
    }

    /// [`encode`](Self::encode) with a postcard payload.
    pub fn encode_message<T: Serialize>(
        &mut self,
        key: &str,
        message: &T,
    ) -> Result<BytesMut, NetError> {
        let type_id = self.outbound_id(key)?;
        Ok(encode_message(type_id, self.local_player_id, message)?)
    }

    /// Point-to-point send on one connection. Never relayed.
    pub fn send(&mut self, conn_id: ConnId, packet: impl Into<Bytes>) -> Result<(), NetError> {
        let endpoint = self
            .endpoint(conn_id)
            .ok_or(NetError::UnknownConnection(conn_id))?;
        endpoint.try_send(packet.into())
    }

    /// Point-to-point send to a logged-in player (host only).
    pub fn send_to_player(
        &mut self,
        player_id: i32,
        packet: impl Into<Bytes>,
    ) -> Result<(), NetError> {
        let endpoint = self
            .peers
            .values()
            .find(|p| p.player.as_ref().is_some_and(|info| info.id == player_id))
            .map(|p| &p.endpoint)
            .ok_or(NetError::UnknownPlayer(player_id))?;
        endpoint.try_send(packet.into())
    }

    /// Mark `packet` as a broadcast and send it: to every logged-in client
    /// when hosting, to the host otherwise.
    pub fn send_broadcast(&mut self, mut packet: BytesMut) -> Result<(), NetError> {
        mark_broadcast(&mut packet);
        let packet = packet.freeze();

        if self.status == NetworkStatus::Hosting {
            for (conn_id, peer) in self.peers.iter().filter(|(_, p)| p.player.is_some()) {
                if let Err(e) = peer.endpoint.try_send(packet.clone()) {
                    warn!(conn_id, error = %e, "Broadcast send failed");
                }
            }
            return Ok(());
        }

        match &self.uplink {
            Some(uplink) => uplink.try_send(packet),
            None => Err(NetError::NotConnected),
        }
    }

    /// Close one player's connection (host only). The departure is
    /// reported on the next tick.
    pub fn disconnect_player(&mut self, player_id: i32) -> Result<(), NetError> {
        let peer = self
            .peers
            .values()
            .find(|p| p.player.as_ref().is_some_and(|info| info.id == player_id))
            .ok_or(NetError::UnknownPlayer(player_id))?;
        info!(player_id, conn_id = peer.endpoint.id(), "Disconnecting player");
        peer.endpoint.close();
        Ok(())
    }

    /// Tear the session down. Safe to call repeatedly and from handlers;
    /// only an actual status change is published.
    pub fn disconnect(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        for (_, peer) in std::mem::take(&mut self.peers) {
            peer.endpoint.close();
            peer.endpoint.join();
        }
        if let Some(uplink) = self.uplink.take() {
            uplink.close();
            uplink.join();
        }

        if self.status != NetworkStatus::Disconnected || self.joining {
            info!(status = ?self.status, "Disconnected");
        }
        self.joining = false;
        self.players.clear();
        self.dictionary.clear();
        self.local_player_id = UNASSIGNED_PLAYER_ID;
        self.next_player_id = HOST_PLAYER_ID + 1;
        self.monitor.reset();
        self.set_status(NetworkStatus::Disconnected);
    }

    pub(crate) fn endpoint(&self, conn_id: ConnId) -> Option<&ConnectionEndpoint> {
        self.peers
            .get(&conn_id)
            .map(|p| &p.endpoint)
            .or_else(|| self.uplink.as_ref().filter(|u| u.id() == conn_id))
    }

    /// Dispatch every frame queued on `conn_id`, in arrival order.
    pub(crate) fn dispatch_queued(&mut self, conn_id: ConnId) {
        let frames = match self.endpoint(conn_id) {
            Some(endpoint) => endpoint.drain_inbound(),
            None => return,
        };
        for frame in frames {
            if self.endpoint(conn_id).is_none() {
                debug!(conn_id, "Connection removed during dispatch; dropping the rest");
                break;
            }
            self.dispatch(conn_id, frame);
        }
    }

    /// Decode one frame, relay it if needed, and hand it to its handler.
    pub(crate) fn dispatch(&mut self, conn_id: ConnId, raw: Bytes) {
        let view = match decode_packet(&raw) {
            Ok(view) => view,
            Err(e) => {
                warn!(conn_id, error = %e, "Dropping malformed packet");
                return;
            }
        };
        debug!(
            conn_id,
            type_id = view.type_id(),
            origin = view.envelope.origin,
            broadcast = view.envelope.broadcast,
            len = view.payload.len(),
            "Inbound packet"
        );

        if self.status == NetworkStatus::Hosting {
            self.dispatch_as_host(conn_id, raw, view);
        } else {
            self.dispatch_as_client(conn_id, view);
        }
    }

    fn dispatch_as_host(&mut self, conn_id: ConnId, raw: Bytes, view: PacketView) {
        let type_id = view.type_id();
        let logged_in = match self.peers.get(&conn_id) {
            Some(peer) => peer.player.is_some(),
            None => return,
        };

        if type_id == BuiltinId::DictionaryRequest.id() {
            self.handle_login(conn_id, view.payload);
            return;
        }
        if !logged_in {
            warn!(conn_id, type_id, "Dropping packet from a connection that has not logged in");
            return;
        }
        if type_id == UNRESOLVED_ID {
            warn!(
                conn_id,
                origin = view.envelope.origin,
                "Dropping packet with unresolved type id 0"
            );
            return;
        }
        match BuiltinId::from_repr(type_id) {
            Some(BuiltinId::KeepAlive) => {
                debug!(conn_id, "Keep-alive");
                return;
            }
            // Dictionary traffic only ever flows from the host.
            Some(builtin) => {
                warn!(
                    conn_id,
                    type_id,
                    key = builtin.key(),
                    "Dropping control message from a client"
                );
                return;
            }
            None => {}
        }

        if view.envelope.broadcast {
            self.relay(conn_id, view.envelope.origin, &raw);
        }

        let Some(message_type) = self.registry.lookup_by_id(type_id) else {
            self.unknown_type(conn_id, type_id);
            return;
        };
        let Some(handler) = message_type.handler() else {
            return;
        };
        let key = message_type.key().to_string();
        self.invoke(conn_id, &view, key, handler);
    }

    fn dispatch_as_client(&mut self, conn_id: ConnId, view: PacketView) {
        let type_id = view.type_id();
        match BuiltinId::from_repr(type_id) {
            Some(BuiltinId::DictionaryResponse) => {
                self.handle_dictionary_response(conn_id, view.payload);
                return;
            }
            Some(BuiltinId::KeepAlive) => {
                debug!(conn_id, "Keep-alive");
                return;
            }
            Some(BuiltinId::DictionaryRequest) => {
                warn!(conn_id, "Ignoring login sent to a client");
                return;
            }
            None => {}
        }

        let Some(key) = self.dictionary.key_of(type_id).map(str::to_string) else {
            self.unknown_type(conn_id, type_id);
            return;
        };
        let Some(handler) = self.registry.lookup_by_key(&key).and_then(|t| t.handler()) else {
            warn!(conn_id, type_id, %key, "No local handler for host message type");
            self.publish(SessionEvent::Alert(format!(
                "No local handler for host message type {key} ({type_id})"
            )));
            return;
        };
        self.invoke(conn_id, &view, key, handler);
    }

    /// Forward the identical bytes to every logged-in client except the
    /// connection it came from and the origin player's own connection.
    fn relay(&self, from: ConnId, origin: i32, raw: &Bytes) {
        for (conn_id, peer) in &self.peers {
            let Some(player) = &peer.player else {
                continue;
            };
            if *conn_id == from || player.id == origin {
                continue;
            }
            if let Err(e) = peer.endpoint.try_send(raw.clone()) {
                warn!(conn_id, error = %e, "Relay send failed");
            }
        }
    }

    fn invoke(
        &mut self,
        conn_id: ConnId,
        view: &PacketView,
        key: String,
        handler: Arc<dyn MessageHandler>,
    ) {
        let origin_id = view.envelope.origin;
        let event = NetworkEvent {
            conn_id,
            origin_id,
            origin: self.players.get(&origin_id).cloned(),
            broadcast: view.envelope.broadcast,
            message_type: key,
        };
        let payload = view.payload.clone();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(self, payload, &event)
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    conn_id,
                    message_type = %event.message_type,
                    error = %e,
                    "Message handler failed"
                );
            }
            Err(_) => {
                error!(conn_id, message_type = %event.message_type, "Message handler panicked");
            }
        }
    }

    fn unknown_type(&mut self, conn_id: ConnId, type_id: i32) {
        let name = self.lookup_name(type_id).to_string();
        warn!(conn_id, type_id, %name, "Unknown message type");
        self.publish(SessionEvent::Alert(format!(
            "Received unknown message type {type_id} ({name})"
        )));
    }

    fn handle_login(&mut self, conn_id: ConnId, payload: Bytes) {
        match self.peers.get(&conn_id) {
            Some(peer) if peer.player.is_some() => {
                warn!(conn_id, "Ignoring repeated login");
                return;
            }
            Some(_) => {}
            None => return,
        }

        let login: Login = match decode_message(&payload) {
            Ok(login) => login,
            Err(e) => {
                warn!(conn_id, error = %e, "Closing connection after a malformed login");
                if let Some(peer) = self.peers.get(&conn_id) {
                    peer.endpoint.close();
                }
                return;
            }
        };

        if let Some(reason) = self.validate_login(&login) {
            warn!(conn_id, player = %login.player_name, %reason, "Rejecting login");
            self.send_control(conn_id, &DictionaryResponse::Rejected { reason });
            if let Some(peer) = self.peers.get(&conn_id) {
                peer.endpoint.close_when_flushed();
            }
            return;
        }

        let player = PlayerInfo {
            id: self.next_player_id,
            name: login.player_name,
            character_name: login.character_name,
        };
        self.next_player_id += 1;
        if let Some(peer) = self.peers.get_mut(&conn_id) {
            peer.player = Some(player.clone());
        }
        self.players.insert(player.id, player.clone());
        info!(conn_id, player_id = player.id, name = %player.name, "Player joined");

        let accepted = DictionaryResponse::Accepted {
            player_id: player.id,
            entries: host_dictionary(&self.registry),
            players: self.players(),
        };
        self.send_control(conn_id, &accepted);
        self.send_roster(Some(conn_id));

        self.publish(SessionEvent::PlayerJoined(player));
        let roster = self.players();
        self.publish(SessionEvent::RosterChanged(roster));
    }

    fn validate_login(&self, login: &Login) -> Option<RejectReason> {
        if login.protocol_version != PROTOCOL_VERSION {
            return Some(RejectReason::VersionMismatch {
                host: PROTOCOL_VERSION,
                client: login.protocol_version,
            });
        }
        if login.password != self.config.password {
            return Some(RejectReason::InvalidPassword);
        }
        None
    }

    fn handle_dictionary_response(&mut self, conn_id: ConnId, payload: Bytes) {
        let response: DictionaryResponse = match decode_message(&payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(conn_id, error = %e, "Dropping malformed dictionary response");
                return;
            }
        };

        match response {
            DictionaryResponse::Accepted {
                player_id,
                entries,
                players,
            } => {
                self.dictionary.replace(&entries);
                self.local_player_id = player_id;
                if self.joining {
                    self.joining = false;
                    self.players = players.into_iter().map(|p| (p.id, p)).collect();
                    info!(conn_id, player_id, types = self.dictionary.len(), "Joined session");
                    self.set_status(NetworkStatus::Connected);
                    self.publish(SessionEvent::ConnectionEstablished { player_id });
                    let roster = self.players();
                    self.publish(SessionEvent::RosterChanged(roster));
                } else {
                    debug!(conn_id, types = self.dictionary.len(), "Dictionary refreshed");
                    self.apply_roster(players);
                }
            }
            DictionaryResponse::Rejected { reason } => {
                warn!(conn_id, %reason, "Login rejected");
                self.publish(SessionEvent::LoginRejected(reason));
                self.disconnect();
            }
            DictionaryResponse::Roster { players } => self.apply_roster(players),
        }
    }

    /// Replace the roster, announcing who joined and who left.
    fn apply_roster(&mut self, players: Vec<PlayerInfo>) {
        let next: BTreeMap<i32, PlayerInfo> = players.into_iter().map(|p| (p.id, p)).collect();
        if next == self.players {
            return;
        }
        let previous = std::mem::replace(&mut self.players, next);

        let left: Vec<PlayerInfo> = previous
            .values()
            .filter(|p| !self.players.contains_key(&p.id))
            .cloned()
            .collect();
        let joined: Vec<PlayerInfo> = self
            .players
            .values()
            .filter(|p| !previous.contains_key(&p.id))
            .cloned()
            .collect();

        for player in left {
            self.publish(SessionEvent::PlayerLeft(player));
        }
        for player in joined {
            self.publish(SessionEvent::PlayerJoined(player));
        }
        let roster = self.players();
        self.publish(SessionEvent::RosterChanged(roster));
    }

    /// Send the roster to every logged-in client except `skip`.
    pub(crate) fn send_roster(&self, skip: Option<ConnId>) {
        let roster = DictionaryResponse::Roster {
            players: self.players(),
        };
        for (conn_id, peer) in &self.peers {
            if peer.player.is_some() && Some(*conn_id) != skip {
                self.send_control(*conn_id, &roster);
            }
        }
    }

    /// Re-send the full dictionary to every logged-in client.
    fn push_dictionary(&self) {
        let entries = host_dictionary(&self.registry);
        let players = self.players();
        for (conn_id, peer) in &self.peers {
            let Some(player) = &peer.player else {
                continue;
            };
            let refresh = DictionaryResponse::Accepted {
                player_id: player.id,
                entries: entries.clone(),
                players: players.clone(),
            };
            self.send_control(*conn_id, &refresh);
        }
    }

    fn send_control(&self, conn_id: ConnId, response: &DictionaryResponse) {
        let Some(endpoint) = self.endpoint(conn_id) else {
            return;
        };
        let result = encode_message(BuiltinId::DictionaryResponse.id(), HOST_PLAYER_ID, response)
            .map_err(NetError::from)
            .and_then(|packet| endpoint.try_send(packet.freeze()));
        if let Err(e) = result {
            warn!(conn_id, error = %e, "Failed to send dictionary response");
        }
    }

    /// Host removes a departed player and tells everyone else.
    pub(crate) fn player_departed(
        &mut self,
        conn_id: ConnId,
        player: Option<PlayerInfo>,
        reason: Option<String>,
    ) {
        if let Some(player) = &player {
            self.players.remove(&player.id);
            info!(conn_id, player_id = player.id, "Player left");
            self.send_roster(None);
        }
        if let Some(reason) = reason {
            self.publish(SessionEvent::ConnectionLost {
                conn_id,
                player: player.clone(),
                reason,
            });
        }
        if let Some(player) = player {
            self.publish(SessionEvent::PlayerLeft(player));
            let roster = self.players();
            self.publish(SessionEvent::RosterChanged(roster));
        }
    }

    fn outbound_id(&mut self, key: &str) -> Result<i32, NetError> {
        let Some(local_id) = self.registry.id_of(key) else {
            return Err(NetError::UnregisteredType(key.to_string()));
        };
        if !self.is_client() {
            return Ok(local_id);
        }

        let type_id = self.dictionary.resolve_outbound(key);
        if type_id == UNRESOLVED_ID {
            warn!(%key, "Message type missing from host dictionary; sending with id 0");
            self.publish(SessionEvent::Alert(format!(
                "Host does not know message type {key}"
            )));
        }
        Ok(type_id)
    }

    fn is_client(&self) -> bool {
        self.joining || self.status == NetworkStatus::Connected
    }

    fn ensure_idle(&self) -> Result<(), NetError> {
        if self.status != NetworkStatus::Disconnected || self.joining {
            return Err(NetError::AlreadyActive(self.status));
        }
        Ok(())
    }

    fn local_player(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.local_player_id,
            name: self.config.player_name.clone(),
            character_name: self.config.character_name.clone(),
        }
    }

    fn set_status(&mut self, status: NetworkStatus) {
        if self.status == status {
            return;
        }
        debug!(from = ?self.status, to = ?status, "Network status changed");
        self.status = status;
        self.publish(SessionEvent::StatusChanged(status));
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn accept_loop(listener: TcpListener, keep_running: Arc<AtomicBool>, accepted: Sender<TcpStream>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "Dropping accepted socket");
                    continue;
                }
                debug!(%peer, "Accepted connection");
                if accepted.send(stream).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;

    fn local_config() -> NetConfig {
        NetConfig {
            listen_address: "127.0.0.1".into(),
            ..NetConfig::default()
        }
    }

    fn noop(_: &mut SessionCoordinator, _: Bytes, _: &NetworkEvent) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn encode_requires_registration() {
        let mut session = SessionCoordinator::new(local_config());
        let err = session.encode("tabletop.map.DrawStroke", |_| {}).unwrap_err();
        assert!(matches!(err, NetError::UnregisteredType(key) if key == "tabletop.map.DrawStroke"));
    }

    #[test]
    fn idle_session_encodes_with_local_ids() {
        let mut session = SessionCoordinator::new(local_config());
        session.register_fn("tabletop.map.DrawStroke", noop);
        let packet = session.encode("tabletop.map.DrawStroke", |b| b.put_u8(7)).unwrap();
        let view = decode_packet(&packet.freeze()).unwrap();
        assert_eq!(view.type_id(), 4);
        assert_eq!(view.envelope.origin, UNASSIGNED_PLAYER_ID);
        assert!(!view.envelope.broadcast);
    }

    #[test]
    fn joining_client_sends_unresolved_types_as_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut session = SessionCoordinator::new(local_config());
        session.register_fn("tabletop.map.DrawStroke", noop);
        let events = session.subscribe();

        session.connect("127.0.0.1", port).unwrap();
        assert!(session.is_joining());
        assert_eq!(session.status(), NetworkStatus::Disconnected);

        let packet = session.encode("tabletop.map.DrawStroke", |_| {}).unwrap();
        assert_eq!(decode_packet(&packet.freeze()).unwrap().type_id(), 0);
        assert!(matches!(events.try_recv(), Ok(SessionEvent::Alert(_))));

        let keep_alive = session.encode(BuiltinId::KeepAlive.key(), |_| {}).unwrap();
        assert_eq!(decode_packet(&keep_alive.freeze()).unwrap().type_id(), 3);
        session.disconnect();
    }

    #[test]
    fn second_start_is_rejected() {
        let mut session = SessionCoordinator::new(local_config());
        session.start_hosting(0).unwrap();
        assert!(matches!(
            session.start_hosting(0),
            Err(NetError::AlreadyActive(NetworkStatus::Hosting))
        ));
        assert!(matches!(
            session.connect("127.0.0.1", 1),
            Err(NetError::AlreadyActive(NetworkStatus::Hosting))
        ));
    }

    #[test]
    fn hosting_seeds_the_roster_with_the_host() {
        let mut session = SessionCoordinator::new(NetConfig {
            player_name: "Gm".into(),
            ..local_config()
        });
        let addr = session.start_hosting(0).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(session.local_addr(), Some(addr));
        assert_eq!(session.local_player_id(), HOST_PLAYER_ID);
        let players = session.players();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "Gm");
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut session = SessionCoordinator::new(local_config());
        let events = session.subscribe();
        session.start_hosting(0).unwrap();
        session.disconnect();
        session.disconnect();

        let statuses: Vec<_> = events.try_iter().collect();
        assert_eq!(
            statuses,
            vec![
                SessionEvent::StatusChanged(NetworkStatus::Hosting),
                SessionEvent::StatusChanged(NetworkStatus::Disconnected),
            ]
        );
        assert!(session.connection_ids().is_empty());
        assert!(session.players().is_empty());
        assert_eq!(session.local_player_id(), UNASSIGNED_PLAYER_ID);
    }

    #[test]
    fn broadcast_needs_a_session() {
        let mut session = SessionCoordinator::new(local_config());
        session.register_fn("tabletop.map.DrawStroke", noop);
        let packet = session.encode("tabletop.map.DrawStroke", |_| {}).unwrap();
        assert!(matches!(session.send_broadcast(packet), Err(NetError::NotConnected)));
        assert!(matches!(
            session.send(42, Bytes::new()),
            Err(NetError::UnknownConnection(42))
        ));
    }

    #[test]
    fn lookup_name_uses_the_sentinel() {
        let mut session = SessionCoordinator::new(local_config());
        session.register_fn("tabletop.map.DrawStroke", noop);
        assert_eq!(session.lookup_name(4), "tabletop.map.DrawStroke");
        assert_eq!(session.lookup_name(99), "UNKNOWN_ID");
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut session = SessionCoordinator::new(local_config());
        let events = session.subscribe();
        session.dispatch(1, Bytes::from_static(&[0, 0, 0]));
        session.dispatch(1, Bytes::from_static(&[7, 0, 0, 0, 4, 0, 0, 0, 1]));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unknown_ids_raise_an_alert() {
        let mut session = SessionCoordinator::new(local_config());
        let events = session.subscribe();
        let raw = encode_packet(99, 0, |_| {}).freeze();
        session.dispatch(1, raw);
        match events.try_recv() {
            Ok(SessionEvent::Alert(message)) => {
                assert!(message.contains("UNKNOWN_ID"), "{message}")
            }
            other => panic!("expected an alert, got {other:?}"),
        }
    }

    #[test]
    fn handler_failures_do_not_stop_dispatch() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = SessionCoordinator::new(local_config());
        session.register_fn(
            "test.Panics",
            |_: &mut SessionCoordinator, _: Bytes, _: &NetworkEvent| -> anyhow::Result<()> {
                panic!("handler bug")
            },
        );
        session.register_fn("test.Fails", |_: &mut SessionCoordinator, _: Bytes, _: &NetworkEvent| {
            anyhow::bail!("bad payload")
        });
        session.register_fn(
            "test.Records",
            move |_: &mut SessionCoordinator, payload: Bytes, event: &NetworkEvent| {
                tx.send((payload, event.clone()))?;
                Ok(())
            },
        );

        session.dictionary.replace(&host_dictionary(&session.registry));
        session.joining = true;

        for type_id in [4, 5, 6] {
            session.dispatch(1, encode_packet(type_id, 2, |b| b.put_u8(type_id as u8)).freeze());
        }

        let (payload, event) = rx.try_recv().unwrap();
        assert_eq!(payload.as_ref(), &[6]);
        assert_eq!(event.message_type, "test.Records");
        assert_eq!(event.origin_id, 2);
        assert!(event.origin.is_none());
        assert!(!event.broadcast);
    }
}
