use std::io::{self, BufRead};
use std::thread;

use bytes::Bytes;
use clap::Parser;
use crossbeam_channel::{select, unbounded};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use tabletop_netsync::{
    NetConfig, NetworkEvent, NetworkStatus, SessionCoordinator, SessionEvent, SessionRuntime,
};

const CHAT_MESSAGE: &str = "tabletop.chat.Message";

/// Headless tabletop session
#[derive(Parser, Debug)]
#[command(name = "tabletop-netd")]
#[command(about = "Host or join a shared tabletop session from the terminal", long_about = None)]
struct Args {
    #[command(flatten)]
    net: NetConfig,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut session = SessionCoordinator::new(args.net);
    session.register_fn(CHAT_MESSAGE, print_chat);
    let events = session.subscribe();
    session.start()?;
    if let Some(addr) = session.local_addr() {
        info!(%addr, "Waiting for players");
    }

    let runtime = SessionRuntime::start(session)?;
    let handle = runtime.handle();

    // Each stdin line is sent as a chat message.
    let (line_tx, line_rx) = unbounded::<String>();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    loop {
        select! {
            recv(line_rx) -> line => {
                let Ok(line) = line else {
                    info!("Input closed");
                    break;
                };
                let text = line.trim();
                if !text.is_empty()
                    && let Err(e) = handle.broadcast(CHAT_MESSAGE, text.as_bytes().to_vec())
                {
                    warn!(error = %e, "Chat message not sent");
                }
            }
            recv(events) -> event => {
                let Ok(event) = event else { break };
                if !log_event(&event) {
                    break;
                }
            }
        }
    }

    handle.disconnect()?;
    drop(runtime);
    Ok(())
}

fn print_chat(
    _: &mut SessionCoordinator,
    payload: Bytes,
    event: &NetworkEvent,
) -> anyhow::Result<()> {
    let text = std::str::from_utf8(&payload)?;
    let from = event
        .origin
        .as_ref()
        .map(|p| p.name.as_str())
        .unwrap_or("unknown");
    info!(from, "{text}");
    Ok(())
}

/// Log one session event. Returns false once the session is over.
fn log_event(event: &SessionEvent) -> bool {
    match event {
        SessionEvent::StatusChanged(NetworkStatus::Disconnected) => {
            info!("Session ended");
            return false;
        }
        SessionEvent::StatusChanged(status) => info!(?status, "Status changed"),
        SessionEvent::ConnectionEstablished { player_id } => {
            info!(player_id, "Joined session");
        }
        SessionEvent::PlayerJoined(player) => {
            info!(player_id = player.id, name = %player.name, "Player joined");
        }
        SessionEvent::PlayerLeft(player) => {
            info!(player_id = player.id, name = %player.name, "Player left");
        }
        SessionEvent::RosterChanged(players) => info!(players = players.len(), "Roster changed"),
        SessionEvent::LoginRejected(reason) => {
            warn!(%reason, "Login rejected");
            return false;
        }
        SessionEvent::ConnectionLost { conn_id, reason, .. } => {
            warn!(conn_id, %reason, "Connection lost");
        }
        SessionEvent::Alert(message) => warn!("{message}"),
    }
    true
}
