#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use tabletop_netproto::constants::{PROTOCOL_VERSION, UNASSIGNED_PLAYER_ID};
use tabletop_netproto::framing::{read_frame, write_frame};
use tabletop_netproto::messages::session::Login;
use tabletop_netproto::msg_id::BuiltinId;
use tabletop_netproto::packet::encode_message;
use tabletop_netproto::{PacketView, decode_packet};
use tabletop_netsync::{NetConfig, NetworkEvent, SessionCoordinator, SessionEvent};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub const DRAW_STROKE: &str = "tabletop.map.DrawStroke";
pub const ERASE: &str = "tabletop.map.Erase";
pub const DEAL: &str = "tabletop.cards.Deal";

/// Route session logs to the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn host_config(name: &str) -> NetConfig {
    init_tracing();
    NetConfig {
        host: true,
        listen_address: "127.0.0.1".into(),
        port: 0,
        player_name: name.into(),
        character_name: format!("{name}'s character"),
        ..NetConfig::default()
    }
}

pub fn client_config(name: &str) -> NetConfig {
    NetConfig {
        address: "127.0.0.1".into(),
        player_name: name.into(),
        character_name: format!("{name}'s character"),
        ..NetConfig::default()
    }
}

pub type Received = Receiver<(Bytes, NetworkEvent)>;

/// Register `key` with a handler that records every dispatched payload.
pub fn record(session: &mut SessionCoordinator, key: &str) -> Received {
    let (tx, rx) = unbounded();
    session.register_fn(
        key,
        move |_: &mut SessionCoordinator, payload: Bytes, event: &NetworkEvent| {
            tx.send((payload, event.clone()))?;
            Ok(())
        },
    );
    rx
}

/// Tick every session until `done` holds.
pub fn pump_until<F>(sessions: &mut [&mut SessionCoordinator], mut done: F) -> Result<()>
where
    F: FnMut(&[&mut SessionCoordinator]) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        for session in sessions.iter_mut() {
            session.tick(Instant::now());
        }
        if done(sessions) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("condition not reached within {TIMEOUT:?}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Tick every session for `duration` regardless of progress.
pub fn pump_for(sessions: &mut [&mut SessionCoordinator], duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        for session in sessions.iter_mut() {
            session.tick(Instant::now());
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Host on a free port and join it with `client`, ticking both until the
/// client is connected.
pub fn join(host: &mut SessionCoordinator, client: &mut SessionCoordinator) -> Result<SocketAddr> {
    let addr = match host.local_addr() {
        Some(addr) => addr,
        None => host.start_hosting(0)?,
    };
    client.connect("127.0.0.1", addr.port())?;
    pump_until(&mut [host, client], |s| {
        s[1].status() == tabletop_netsync::NetworkStatus::Connected
    })?;
    Ok(addr)
}

/// Hand-driven peer speaking the wire protocol directly.
pub struct RawClient {
    stream: TcpStream,
    frames: Receiver<Bytes>,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let mut reader = stream.try_clone()?;
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            while let Ok(frame) = read_frame(&mut reader) {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        Ok(Self { stream, frames: rx })
    }

    pub fn send(&mut self, packet: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, packet)?;
        Ok(())
    }

    pub fn login(&mut self, name: &str, protocol_version: u32, password: &str) -> Result<()> {
        let login = Login {
            protocol_version,
            player_name: name.into(),
            character_name: String::new(),
            password: password.into(),
        };
        let packet = encode_message(
            BuiltinId::DictionaryRequest.id(),
            UNASSIGNED_PLAYER_ID,
            &login,
        )?;
        self.send(&packet)
    }

    pub fn login_ok(&mut self, name: &str) -> Result<()> {
        self.login(name, PROTOCOL_VERSION, "")
    }

    /// Tick `host` until the next frame arrives.
    pub fn recv(&self, host: &mut SessionCoordinator) -> Result<PacketView> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            host.tick(Instant::now());
            match self.frames.recv_timeout(Duration::from_millis(5)) {
                Ok(frame) => return Ok(decode_packet(&frame)?),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("connection closed by host"),
            }
            if Instant::now() >= deadline {
                bail!("no frame within {TIMEOUT:?}");
            }
        }
    }

    /// Tick `host` until a frame of `type_id` arrives, skipping others.
    pub fn recv_type(&self, host: &mut SessionCoordinator, type_id: i32) -> Result<PacketView> {
        loop {
            let view = self.recv(host)?;
            if view.type_id() == type_id {
                return Ok(view);
            }
        }
    }

    /// Tick `host` until it closes this connection.
    pub fn wait_closed(&self, host: &mut SessionCoordinator) -> Result<Vec<PacketView>> {
        let mut frames = Vec::new();
        let deadline = Instant::now() + TIMEOUT;
        loop {
            host.tick(Instant::now());
            match self.frames.recv_timeout(Duration::from_millis(5)) {
                Ok(frame) => frames.push(decode_packet(&frame)?),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Ok(frames),
            }
            if Instant::now() >= deadline {
                bail!("host did not close the connection within {TIMEOUT:?}");
            }
        }
    }

    pub fn shutdown(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

pub fn drain(events: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    events.try_iter().collect()
}
