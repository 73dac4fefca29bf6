//! Monitor thread that owns the session.
//!
//! [`SessionRuntime::start`] moves a [`SessionCoordinator`] into a dedicated
//! thread. The thread ticks it once per poll period and runs commands sent
//! through [`SessionHandle`] in between, so all session state stays on one
//! thread without locks.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use tabletop_netproto::messages::session::PlayerInfo;
use tracing::{error, info};

use crate::error::NetError;
use crate::event::{NetworkStatus, SessionEvent};
use crate::session::SessionCoordinator;

pub const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

type SessionJob = Box<dyn FnOnce(&mut SessionCoordinator) + Send>;

enum SessionCommand {
    Run(SessionJob),
    Stop,
}

struct RuntimeInner {
    cmd_tx: Sender<SessionCommand>,
}

pub struct SessionRuntime {
    inner: Arc<RuntimeInner>,
    join: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RuntimeInner>,
}

impl SessionRuntime {
    pub fn start(session: SessionCoordinator) -> Result<Self, NetError> {
        let (cmd_tx, cmd_rx) = unbounded();
        let join = thread::Builder::new()
            .name("net-monitor".into())
            .spawn(move || run_monitor(session, cmd_rx))?;

        Ok(Self {
            inner: Arc::new(RuntimeInner { cmd_tx }),
            join: Some(join),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        let _ = self.inner.cmd_tx.send(SessionCommand::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl SessionHandle {
    /// Run `f` on the monitor thread and wait for its result.
    pub fn with_session<R, F>(&self, op: &'static str, f: F) -> Result<R, NetError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SessionCoordinator) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded::<R>(1);
        let job: SessionJob = Box::new(move |session: &mut SessionCoordinator| {
            let _ = reply_tx.send(f(session));
        });
        self.inner
            .cmd_tx
            .send(SessionCommand::Run(job))
            .map_err(|_| NetError::RuntimeStopped)?;
        match reply_rx.recv_timeout(COMMAND_REPLY_TIMEOUT) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(NetError::RuntimeTimeout { op }),
            Err(RecvTimeoutError::Disconnected) => Err(NetError::RuntimeStopped),
        }
    }

    pub fn start_hosting(&self, port: u16) -> Result<SocketAddr, NetError> {
        self.with_session("start_hosting", move |s| s.start_hosting(port))?
    }

    pub fn connect(&self, address: impl Into<String>, port: u16) -> Result<(), NetError> {
        let address = address.into();
        self.with_session("connect", move |s| s.connect(&address, port))?
    }

    pub fn disconnect(&self) -> Result<(), NetError> {
        self.with_session("disconnect", SessionCoordinator::disconnect)
    }

    /// Encode `payload` for `key` and broadcast it.
    pub fn broadcast(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<(), NetError> {
        let key = key.into();
        self.with_session("broadcast", move |s| {
            let packet = s.encode(&key, |buf| buf.extend_from_slice(&payload))?;
            s.send_broadcast(packet)
        })?
    }

    pub fn status(&self) -> Result<NetworkStatus, NetError> {
        self.with_session("status", |s| s.status())
    }

    pub fn players(&self) -> Result<Vec<PlayerInfo>, NetError> {
        self.with_session("players", |s| s.players())
    }

    pub fn subscribe(&self) -> Result<Receiver<SessionEvent>, NetError> {
        self.with_session("subscribe", SessionCoordinator::subscribe)
    }
}

fn run_monitor(mut session: SessionCoordinator, commands: Receiver<SessionCommand>) {
    let poll = session.monitor.poll_interval();
    info!(poll_ms = poll.as_millis() as u64, "Session monitor started");
    let mut next_tick = Instant::now() + poll;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match commands.recv_timeout(wait) {
            Ok(SessionCommand::Run(job)) => {
                if panic::catch_unwind(AssertUnwindSafe(|| job(&mut session))).is_err() {
                    error!("Session command panicked");
                }
            }
            Ok(SessionCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            session.tick(now);
            next_tick = now + poll;
        }
    }

    session.disconnect();
    info!("Session monitor stopped");
}
