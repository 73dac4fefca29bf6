//! One stream socket with its reader and writer threads.
//!
//! Inbound frames are queued by the reader thread and only consumed by the
//! monitor tick through [`ConnectionEndpoint::drain_inbound`]. Outbound
//! packets are queued by [`ConnectionEndpoint::try_send`] and written by the
//! writer thread, so neither side ever blocks the session.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tabletop_netproto::framing::{read_frame, write_frame};
use tracing::{debug, info, warn};

use crate::error::NetError;

pub type ConnId = u64;

/// Upper bound for one outbound connect attempt per resolved address.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Closed locally or by a clean EOF from the peer.
    Closed,
    /// Connect, read or write failed.
    Lost,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Lost)
    }
}

struct Shared {
    id: ConnId,
    state: Mutex<ConnectionState>,
    reason: Mutex<Option<String>>,
    socket: Mutex<Option<TcpStream>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Last time a frame arrived (or the endpoint was created).
    last_activity: Mutex<Instant>,
    closed_locally: AtomicBool,
    departure_taken: AtomicBool,
}

impl Shared {
    fn new(id: ConnId) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            reason: Mutex::new(None),
            socket: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            closed_locally: AtomicBool::new(false),
            departure_taken: AtomicBool::new(false),
        }
    }

    /// Move to a terminal state. Only the first terminal transition sticks.
    fn finish(&self, next: ConnectionState, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;
        *self.reason.lock() = Some(reason.into());
        true
    }

    /// Store the socket and go `Open`, unless `close()` already ran.
    fn attach(&self, stream: &TcpStream) -> io::Result<bool> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(false);
        }
        *self.socket.lock() = Some(stream.try_clone()?);
        *state = ConnectionState::Open;
        Ok(true)
    }

    fn shutdown_socket(&self) {
        if let Some(socket) = self.socket.lock().as_ref() {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Bidirectional packet connection over one TCP socket.
pub struct ConnectionEndpoint {
    id: ConnId,
    peer: String,
    shared: Arc<Shared>,
    outbound: Mutex<Option<Sender<Bytes>>>,
    inbound: Receiver<Bytes>,
}

impl ConnectionEndpoint {
    /// Start connecting to `addr` (`host:port`) on a dedicated I/O thread.
    ///
    /// Returns immediately in `Connecting`; packets queued meanwhile are
    /// written once the socket opens.
    pub fn connect(addr: impl Into<String>) -> Result<Self, NetError> {
        Self::connect_with(addr.into(), connect_any)
    }

    fn connect_with<C>(peer: String, connector: C) -> Result<Self, NetError>
    where
        C: FnOnce(&str) -> io::Result<TcpStream> + Send + 'static,
    {
        let id = next_conn_id();
        let shared = Arc::new(Shared::new(id));
        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();

        let io_shared = Arc::clone(&shared);
        let target = peer.clone();
        let handle = thread::Builder::new()
            .name(format!("net-conn-{id}"))
            .spawn(move || {
                let stream = match connector(&target) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(conn_id = id, peer = %target, error = %e, "Connect failed");
                        io_shared.finish(ConnectionState::Lost, format!("connect failed: {e}"));
                        return;
                    }
                };
                if let Err(e) = run_socket(&io_shared, stream, out_rx, in_tx) {
                    io_shared.finish(ConnectionState::Lost, e.to_string());
                    io_shared.shutdown_socket();
                }
            })?;
        shared.threads.lock().push(handle);

        Ok(Self {
            id,
            peer,
            shared,
            outbound: Mutex::new(Some(out_tx)),
            inbound: in_rx,
        })
    }

    /// Wrap an already connected socket (host accept path). Starts `Open`.
    pub fn from_stream(stream: TcpStream) -> Result<Self, NetError> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let id = next_conn_id();
        let shared = Arc::new(Shared::new(id));
        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();

        let _ = stream.set_nodelay(true);
        shared.attach(&stream)?;
        let writer = spawn_writer(&shared, stream.try_clone()?, out_rx)?;
        shared.threads.lock().push(writer);

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name(format!("net-read-{id}"))
            .spawn(move || read_loop(&reader_shared, stream, in_tx))?;
        shared.threads.lock().push(reader);

        debug!(conn_id = id, %peer, "Connection opened");
        Ok(Self {
            id,
            peer,
            shared,
            outbound: Mutex::new(Some(out_tx)),
            inbound: in_rx,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Why the connection ended, once it has.
    pub fn reason(&self) -> Option<String> {
        self.shared.reason.lock().clone()
    }

    /// Queue one packet for the writer thread. Never blocks.
    pub fn try_send(&self, packet: Bytes) -> Result<(), NetError> {
        if self.state().is_terminal() {
            return Err(NetError::ConnectionClosed);
        }
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(packet).map_err(|_| NetError::ConnectionClosed),
            None => Err(NetError::ConnectionClosed),
        }
    }

    /// When the last inbound frame arrived.
    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    /// Frames received since the last drain, in arrival order.
    pub fn drain_inbound(&self) -> Vec<Bytes> {
        self.inbound.try_iter().collect()
    }

    /// Close now. In-flight outbound packets are abandoned. Idempotent.
    pub fn close(&self) {
        self.shared.closed_locally.store(true, Ordering::Release);
        let first = self.shared.finish(ConnectionState::Closed, "closed locally");
        self.outbound.lock().take();
        self.shared.shutdown_socket();
        if first {
            debug!(conn_id = self.id, "Connection closed");
        }
    }

    /// Drop the connection as lost. Unlike [`close`](Self::close) the
    /// departure is still reported through
    /// [`take_departure`](Self::take_departure).
    pub fn abort(&self, reason: impl Into<String>) {
        let first = self.shared.finish(ConnectionState::Lost, reason);
        self.outbound.lock().take();
        self.shared.shutdown_socket();
        if first {
            debug!(conn_id = self.id, "Connection aborted");
        }
    }

    /// Stop accepting packets and close once the queued ones are written.
    pub fn close_when_flushed(&self) {
        self.shared.closed_locally.store(true, Ordering::Release);
        self.outbound.lock().take();
    }

    /// Wait for the I/O threads. A handle owned by the calling thread is
    /// skipped.
    ///
    /// A connect that is still in flight is not waited for: once it returns
    /// it finds the endpoint closed and exits on its own.
    pub fn join(&self) {
        if self.shared.socket.lock().is_none() {
            self.shared.threads.lock().clear();
            return;
        }
        let current = thread::current().id();
        loop {
            let handles = std::mem::take(&mut *self.shared.threads.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }

    /// Report a remote close or loss exactly once. Local closes never
    /// report.
    pub fn take_departure(&self) -> Option<String> {
        if !self.state().is_terminal() || self.shared.closed_locally.load(Ordering::Acquire) {
            return None;
        }
        if self.shared.departure_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(self.reason().unwrap_or_else(|| "connection ended".to_string()))
    }
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Try every resolved address of `target` in turn.
fn connect_any(target: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

/// Body of the outbound connect thread once the socket is up.
fn run_socket(
    shared: &Arc<Shared>,
    stream: TcpStream,
    outbound: Receiver<Bytes>,
    inbound: Sender<Bytes>,
) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    if !shared.attach(&stream)? {
        return Ok(());
    }
    info!(conn_id = shared.id, "Connected");

    let writer = spawn_writer(shared, stream.try_clone()?, outbound)?;
    shared.threads.lock().push(writer);
    read_loop(shared, stream, inbound);
    Ok(())
}

fn spawn_writer(
    shared: &Arc<Shared>,
    stream: TcpStream,
    outbound: Receiver<Bytes>,
) -> io::Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("net-write-{}", shared.id))
        .spawn(move || write_loop(&shared, stream, outbound))
}

fn read_loop(shared: &Shared, mut stream: TcpStream, inbound: Sender<Bytes>) {
    loop {
        match read_frame(&mut stream) {
            Ok(frame) => {
                *shared.last_activity.lock() = Instant::now();
                if inbound.send(frame).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                if shared.finish(ConnectionState::Closed, "closed by peer") {
                    debug!(conn_id = shared.id, "Peer closed the connection");
                }
                return;
            }
            Err(e) => {
                if shared.finish(ConnectionState::Lost, format!("read failed: {e}")) {
                    warn!(conn_id = shared.id, error = %e, "Connection lost");
                }
                return;
            }
        }
    }
}

fn write_loop(shared: &Shared, mut stream: TcpStream, outbound: Receiver<Bytes>) {
    for packet in outbound.iter() {
        if let Err(e) = write_frame(&mut stream, &packet) {
            if shared.finish(ConnectionState::Lost, format!("write failed: {e}")) {
                warn!(conn_id = shared.id, error = %e, "Write failed");
            }
            shared.shutdown_socket();
            return;
        }
    }
    // All senders dropped: flushed everything we were asked to.
    let _ = stream.shutdown(Shutdown::Both);
}
