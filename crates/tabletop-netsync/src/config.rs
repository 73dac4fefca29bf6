use std::time::Duration;

use clap::Args;

pub const DEFAULT_PORT: u16 = 6812;
pub const DEFAULT_ADDRESS: &str = "localhost";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";

/// Network settings consumed by the session.
///
/// The session never loads these itself; the application's settings store
/// (or the command line, see `tabletop-netd`) builds one and hands it in.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct NetConfig {
    /// Host the session instead of joining one
    #[arg(long)]
    pub host: bool,

    /// Address of the host to join
    #[arg(long, default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Port to listen on when hosting, or to connect to when joining
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface the host listens on
    #[arg(long, default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Shared session password (plaintext)
    #[arg(long, default_value = "")]
    pub password: String,

    /// Display name of the local player
    #[arg(long, default_value = "Player")]
    pub player_name: String,

    /// Character the local player controls
    #[arg(long, default_value = "")]
    pub character_name: String,

    /// Liveness poll period in milliseconds
    #[arg(long, default_value_t = 1500)]
    pub poll_interval_ms: u64,

    /// Keep-alive interval in milliseconds
    #[arg(long, default_value_t = 20_000)]
    pub heartbeat_interval_ms: u64,

    /// Drop connections silent for this long, in milliseconds (0 = never)
    #[arg(long, default_value_t = 60_000)]
    pub idle_timeout_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host: false,
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            password: String::new(),
            player_name: "Player".to_string(),
            character_name: String::new(),
            poll_interval_ms: 1500,
            heartbeat_interval_ms: 20_000,
            idle_timeout_ms: 60_000,
        }
    }
}

impl NetConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `None` when idle eviction is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        net: NetConfig,
    }

    #[test]
    fn cli_defaults_match_default_impl() {
        let cli = Cli::parse_from(["tabletop"]);
        assert_eq!(cli.net, NetConfig::default());
        assert_eq!(cli.net.port, 6812);
        assert_eq!(cli.net.address, "localhost");
        assert!(cli.net.password.is_empty());
        assert!(!cli.net.host);
        assert_eq!(cli.net.idle_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "tabletop",
            "--host",
            "--port",
            "7000",
            "--password",
            "dragons",
            "--heartbeat-interval-ms",
            "500",
            "--idle-timeout-ms",
            "0",
        ]);
        assert!(cli.net.host);
        assert_eq!(cli.net.port, 7000);
        assert_eq!(cli.net.password, "dragons");
        assert_eq!(cli.net.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(cli.net.idle_timeout(), None);
    }
}
