//! Liveness poll: departures, inbound dispatch and heartbeats.
//!
//! Everything the network does to session state happens inside
//! [`SessionCoordinator::tick`], which the monitor thread calls once per poll
//! period. Lost connections are noticed here rather than from the socket
//! threads, and connections that stay silent past the idle timeout are
//! evicted.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tabletop_netproto::constants::HOST_PLAYER_ID;
use tabletop_netproto::encode_packet;
use tabletop_netproto::msg_id::BuiltinId;
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::connection::{ConnId, ConnectionEndpoint};
use crate::event::{NetworkStatus, SessionEvent};
use crate::session::{PeerConn, SessionCoordinator};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct KeepAliveMonitor {
    poll_interval: Duration,
    heartbeat_interval: Duration,
    idle_timeout: Option<Duration>,
    last_heartbeat: Option<Instant>,
}

impl KeepAliveMonitor {
    pub fn new(poll_interval: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            poll_interval,
            heartbeat_interval,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            last_heartbeat: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn from_config(config: &NetConfig) -> Self {
        Self::new(config.poll_interval(), config.heartbeat_interval())
            .with_idle_timeout(config.idle_timeout())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// True if nothing has arrived since `last_activity` for longer than
    /// the idle timeout.
    pub fn is_stale(&self, last_activity: Instant, now: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|max_idle| now.saturating_duration_since(last_activity) > max_idle)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// True once per elapsed heartbeat interval. The first call only starts
    /// the clock.
    pub fn heartbeat_due(&mut self, now: Instant) -> bool {
        match self.last_heartbeat {
            None => {
                self.last_heartbeat = Some(now);
                false
            }
            Some(last) if now.saturating_duration_since(last) >= self.heartbeat_interval => {
                self.last_heartbeat = Some(now);
                true
            }
            Some(_) => false,
        }
    }

    pub fn reset(&mut self) {
        self.last_heartbeat = None;
    }
}

impl Default for KeepAliveMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_HEARTBEAT_INTERVAL)
    }
}

impl SessionCoordinator {
    /// One liveness poll.
    ///
    /// Adopts accepted sockets, evicts idle ones, reports connections that
    /// went away, then
    /// dispatches queued packets per connection in arrival order, and finally
    /// sends a keep-alive if one is due.
    pub fn tick(&mut self, now: Instant) {
        self.adopt_accepted();
        self.evict_idle(now);
        self.reap_departures();

        for conn_id in self.connection_ids() {
            self.dispatch_queued(conn_id);
        }

        if self.monitor.heartbeat_due(now) {
            self.send_keep_alive();
        }
    }

    fn adopt_accepted(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        let streams: Vec<_> = listener.accepted.try_iter().collect();
        for stream in streams {
            match ConnectionEndpoint::from_stream(stream) {
                Ok(endpoint) => {
                    info!(
                        conn_id = endpoint.id(),
                        peer = %endpoint.peer(),
                        "Connection awaiting login"
                    );
                    self.peers.insert(
                        endpoint.id(),
                        PeerConn {
                            endpoint,
                            player: None,
                        },
                    );
                }
                Err(e) => warn!(error = %e, "Failed to adopt accepted socket"),
            }
        }
    }

    /// Abort connections with no inbound traffic for longer than the idle
    /// timeout. Pending logins count too. The departure is reported by
    /// [`reap_departures`](Self::reap_departures) like any other loss.
    fn evict_idle(&self, now: Instant) {
        let stale = self
            .peers
            .values()
            .map(|peer| &peer.endpoint)
            .chain(self.uplink.as_ref())
            .filter(|endpoint| !endpoint.state().is_terminal())
            .filter(|endpoint| self.monitor.is_stale(endpoint.last_activity(), now));
        for endpoint in stale {
            info!(
                conn_id = endpoint.id(),
                peer = %endpoint.peer(),
                "Disconnecting idle connection"
            );
            endpoint.abort("idle timeout");
        }
    }

    fn reap_departures(&mut self) {
        let ended: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.endpoint.state().is_terminal())
            .map(|(conn_id, _)| *conn_id)
            .collect();

        for conn_id in ended {
            // Whatever arrived before the socket went away still counts.
            self.dispatch_queued(conn_id);
            let Some(peer) = self.peers.remove(&conn_id) else {
                continue;
            };
            let reason = peer.endpoint.take_departure();
            peer.endpoint.close();
            peer.endpoint.join();
            if let Some(reason) = &reason {
                warn!(conn_id, %reason, "Connection lost");
            } else {
                debug!(conn_id, "Connection closed locally");
            }
            if reason.is_some() || peer.player.is_some() {
                self.player_departed(conn_id, peer.player, reason);
            }
        }

        let uplink_ended = self
            .uplink
            .as_ref()
            .filter(|uplink| uplink.state().is_terminal())
            .map(ConnectionEndpoint::id);
        if let Some(conn_id) = uplink_ended {
            self.dispatch_queued(conn_id);
            let Some(reason) = self
                .uplink
                .as_ref()
                .and_then(ConnectionEndpoint::take_departure)
            else {
                return;
            };
            warn!(conn_id, %reason, "Lost connection to host");
            let host = self.player(HOST_PLAYER_ID).cloned();
            self.publish(SessionEvent::ConnectionLost {
                conn_id,
                player: host,
                reason,
            });
            self.disconnect();
        }
    }

    fn send_keep_alive(&mut self) {
        let packet = Bytes::from(encode_packet(
            BuiltinId::KeepAlive.id(),
            self.local_player_id(),
            |_| {},
        ));

        if self.status() == NetworkStatus::Hosting {
            for (conn_id, peer) in self.peers.iter().filter(|(_, p)| p.player.is_some()) {
                if let Err(e) = peer.endpoint.try_send(packet.clone()) {
                    debug!(conn_id, error = %e, "Keep-alive not sent");
                }
            }
        } else if let Some(uplink) = &self.uplink {
            if let Err(e) = uplink.try_send(packet) {
                debug!(conn_id = uplink.id(), error = %e, "Keep-alive not sent");
            }
        }
    }
}
