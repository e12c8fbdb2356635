//! Configuration: CLI arguments with environment variable support, plus an
//! optional TOML file for the tuning knobs that rarely change per host.

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::BridgeConfig;
use crate::circuit::CircuitConfig;
use crate::ratelimit::RateLimitConfig;
use crate::room::RoomConfig;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Position(s) this relay is willing to take in a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Entry,
    Middle,
    Exit,
    Any,
}

impl RelayMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "entry" => Some(RelayMode::Entry),
            "middle" => Some(RelayMode::Middle),
            "exit" => Some(RelayMode::Exit),
            "any" => Some(RelayMode::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Entry => "entry",
            RelayMode::Middle => "middle",
            RelayMode::Exit => "exit",
            RelayMode::Any => "any",
        }
    }

    /// Whether this relay accepts circuit-originating clients.
    pub fn accepts_clients(&self) -> bool {
        matches!(self, RelayMode::Entry | RelayMode::Any)
    }

    /// Whether this relay may deliver exit traffic.
    pub fn allows_exit(&self) -> bool {
        matches!(self, RelayMode::Exit | RelayMode::Any)
    }
}

/// CLI arguments for the relay
///
/// Supports environment variables with VEIL_RELAY_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Relay node for an anonymizing multi-hop transport")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// Optional TOML file with tuning sections
    #[arg(long = "config_file", short = 'c', env = "VEIL_RELAY_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Address to bind the relay listener
    #[arg(long, env = "VEIL_RELAY_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Relay listener port
    #[arg(long, env = "VEIL_RELAY_LISTEN_PORT", default_value_t = 9030)]
    pub listen_port: u16,

    /// Admin/metrics HTTP port
    #[arg(long, env = "VEIL_RELAY_ADMIN_PORT", default_value_t = 9090)]
    pub admin_port: u16,

    /// Relay mode: entry, middle, exit, any
    #[arg(long, env = "VEIL_RELAY_MODE", default_value = "any")]
    pub mode: String,

    /// Stable relay identifier; generated at startup when omitted
    #[arg(long, env = "VEIL_RELAY_ID")]
    pub relay_id: Option<String>,

    /// TLS certificate file; enables TLS together with --key_file
    #[arg(long, env = "VEIL_RELAY_CERT_FILE")]
    pub cert_file: Option<String>,

    /// TLS private key file
    #[arg(long, env = "VEIL_RELAY_KEY_FILE")]
    pub key_file: Option<String>,

    /// Log mode: trace, debug, info, warn, error (default: info)
    #[arg(long, env = "VEIL_RELAY_LOG_MODE", default_value = "info")]
    pub log_mode: String,

    /// Maximum concurrent inbound connections
    #[arg(long, env = "VEIL_RELAY_MAX_CONNECTIONS", default_value_t = 4096)]
    pub max_connections: usize,

    /// Publicly reachable endpoint announced to the directory; defaults to
    /// the listen address
    #[arg(long, env = "VEIL_RELAY_PUBLIC_ENDPOINT")]
    pub public_endpoint: Option<String>,

    /// Directory service base URL; registration is skipped when omitted
    #[arg(long, env = "VEIL_RELAY_DIRECTORY_URL")]
    pub directory_url: Option<String>,

    /// Advertised bandwidth ceiling in bytes/sec (0 = unlimited)
    #[arg(long, env = "VEIL_RELAY_MAX_BANDWIDTH", default_value_t = 0)]
    pub max_bandwidth: u64,

    // ==================== Performance Tuning ====================
    /// Per-read deadline on peer connections (default: 60s)
    #[arg(long, env = "VEIL_RELAY_READ_TIMEOUT", default_value = "60s", value_parser = parse_duration, help_heading = "Performance")]
    pub read_timeout: Duration,

    /// Per-write deadline on peer connections (default: 30s)
    #[arg(long, env = "VEIL_RELAY_WRITE_TIMEOUT", default_value = "30s", value_parser = parse_duration, help_heading = "Performance")]
    pub write_timeout: Duration,

    /// TLS handshake timeout (default: 10s)
    #[arg(long, env = "VEIL_RELAY_TLS_HANDSHAKE_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub tls_handshake_timeout: Duration,

    /// Connect timeout for outbound links to other relays (default: 5s)
    #[arg(long, env = "VEIL_RELAY_CONNECT_TIMEOUT", default_value = "5s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Maximum wire frame size in bytes (default: 64MB)
    #[arg(long, env = "VEIL_RELAY_MAX_FRAME_LEN", default_value_t = 64 * 1024 * 1024, help_heading = "Performance")]
    pub max_frame_len: usize,

    /// TCP listen backlog for pending connections (default: 1024)
    #[arg(
        long,
        env = "VEIL_RELAY_TCP_BACKLOG",
        default_value_t = 1024,
        help_heading = "Performance"
    )]
    pub tcp_backlog: i32,

    /// Enable TCP_NODELAY for lower latency (default: true)
    #[arg(
        long,
        env = "VEIL_RELAY_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_host.is_empty() {
            return Err(anyhow!("listen host is required"));
        }
        if RelayMode::from_str(&self.mode).is_none() {
            return Err(anyhow!(
                "invalid mode '{}': expected entry, middle, exit or any",
                self.mode
            ));
        }
        if self.listen_port == self.admin_port {
            return Err(anyhow!("relay and admin ports must differ"));
        }
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    return Err(anyhow!("TLS certificate file not found: {}", cert));
                }
                if !std::path::Path::new(key).exists() {
                    return Err(anyhow!("TLS private key file not found: {}", key));
                }
            }
            (None, None) => {}
            _ => {
                return Err(anyhow!(
                    "TLS requires both --cert_file and --key_file"
                ));
            }
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(anyhow!("timeouts must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than 0"));
        }
        if let Some(ref path) = self.config_file {
            if !path.exists() {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Optional TOML file. Every field is optional; absent fields keep defaults.

#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub circuit: CircuitSection,
    #[serde(default)]
    pub room: RoomSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct CircuitSection {
    pub max_circuits: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_bytes_per_circuit: Option<u64>,
    pub max_decrypt_failures: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomSection {
    pub max_rooms: Option<usize>,
    pub default_expiry_secs: Option<u64>,
    pub max_expiry_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub code_word_count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RateLimitSection {
    pub rate_per_sec: Option<f64>,
    pub burst: Option<f64>,
    pub ban_threshold: Option<u32>,
    pub ban_duration_secs: Option<u64>,
    pub retention_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BridgeSection {
    pub max_bytes: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub ping_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub relay_id: String,
    pub mode: RelayMode,
    pub listen_addr: String,
    pub admin_addr: String,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
    pub tcp_backlog: i32,
    pub tcp_nodelay: bool,
    pub tls: Option<TlsPaths>,
    pub public_endpoint: Option<String>,
    pub directory_url: Option<String>,
    pub max_bandwidth: u64,
    pub circuit: CircuitConfig,
    pub room: RoomConfig,
    pub rate_limit: RateLimitConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl RelayConfig {
    /// Merge CLI args with the optional TOML file. CLI owns the network
    /// surface; the file owns the subsystem tuning.
    pub fn build(cli: &CliArgs) -> Result<Self> {
        cli.validate()?;
        let file = match &cli.config_file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        // The unwrap-free parse: validate() already checked the mode.
        let mode = RelayMode::from_str(&cli.mode)
            .ok_or_else(|| anyhow!("invalid mode '{}'", cli.mode))?;

        let circuit_defaults = CircuitConfig::default();
        let circuit = CircuitConfig {
            max_circuits: file.circuit.max_circuits.unwrap_or(circuit_defaults.max_circuits),
            idle_timeout: file
                .circuit
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(circuit_defaults.idle_timeout),
            sweep_interval: file
                .circuit
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(circuit_defaults.sweep_interval),
            max_bytes_per_circuit: file
                .circuit
                .max_bytes_per_circuit
                .unwrap_or(circuit_defaults.max_bytes_per_circuit),
            max_decrypt_failures: file
                .circuit
                .max_decrypt_failures
                .unwrap_or(circuit_defaults.max_decrypt_failures),
        };

        let room_defaults = RoomConfig::default();
        let room = RoomConfig {
            max_rooms: file.room.max_rooms.unwrap_or(room_defaults.max_rooms),
            default_expiry: file
                .room
                .default_expiry_secs
                .map(Duration::from_secs)
                .unwrap_or(room_defaults.default_expiry),
            max_expiry: file
                .room
                .max_expiry_secs
                .map(Duration::from_secs)
                .unwrap_or(room_defaults.max_expiry),
            sweep_interval: file
                .room
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(room_defaults.sweep_interval),
            code_word_count: file
                .room
                .code_word_count
                .unwrap_or(room_defaults.code_word_count),
        };

        let rl_defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            rate_per_sec: file.rate_limit.rate_per_sec.unwrap_or(rl_defaults.rate_per_sec),
            burst: file.rate_limit.burst.unwrap_or(rl_defaults.burst),
            ban_threshold: file
                .rate_limit
                .ban_threshold
                .unwrap_or(rl_defaults.ban_threshold),
            ban_duration: file
                .rate_limit
                .ban_duration_secs
                .map(Duration::from_secs)
                .unwrap_or(rl_defaults.ban_duration),
            retention: file
                .rate_limit
                .retention_secs
                .map(Duration::from_secs)
                .unwrap_or(rl_defaults.retention),
            sweep_interval: file
                .rate_limit
                .sweep_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(rl_defaults.sweep_interval),
        };

        let bridge_defaults = BridgeConfig::default();
        let bridge = BridgeConfig {
            max_bytes: file.bridge.max_bytes.unwrap_or(bridge_defaults.max_bytes),
            idle_timeout: file
                .bridge
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(bridge_defaults.idle_timeout),
            watchdog_interval: bridge_defaults.watchdog_interval,
            read_timeout: file
                .bridge
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(bridge_defaults.read_timeout),
            ping_interval: file
                .bridge
                .ping_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(bridge_defaults.ping_interval),
        };

        let tls = match (&cli.cert_file, &cli.key_file) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            _ => None,
        };

        Ok(RelayConfig {
            relay_id: cli
                .relay_id
                .clone()
                .unwrap_or_else(crate::circuit::generate_circuit_id),
            mode,
            listen_addr: format!("{}:{}", cli.listen_host, cli.listen_port),
            admin_addr: format!("{}:{}", cli.listen_host, cli.admin_port),
            max_connections: cli.max_connections,
            read_timeout: cli.read_timeout,
            write_timeout: cli.write_timeout,
            tls_handshake_timeout: cli.tls_handshake_timeout,
            connect_timeout: cli.connect_timeout,
            max_frame_len: cli.max_frame_len,
            tcp_backlog: cli.tcp_backlog,
            tcp_nodelay: cli.tcp_nodelay,
            tls,
            public_endpoint: cli.public_endpoint.clone(),
            directory_url: cli.directory_url.clone(),
            max_bandwidth: cli.max_bandwidth,
            circuit,
            room,
            rate_limit,
            bridge,
        })
    }
}
