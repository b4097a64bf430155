//! Runtime configuration — CLI flags layered over environment variables and
//! built-in defaults, modeled on the teacher daemon's `config::DaemonConfig`.
//!
//! Config-file layout and key-material persistence are intentionally out of
//! scope; this module only covers the crate's own process-local knobs.

use clap::Parser;
use std::time::Duration;

const DEFAULT_PORT: u16 = 7300;
const DEFAULT_REPLAY_TTL_SECS: u64 = 600; // 10 minutes
const DEFAULT_SKEW_SECS: i64 = 300;
const DEFAULT_SHARED_KEY_TTL_SECS: u64 = 3600;
const DEFAULT_TOKEN_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PING_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RECONNECT_BASE_SECS: u64 = 1;
const DEFAULT_RECONNECT_MAX_SECS: u64 = 30;

#[derive(Parser, Debug, Clone)]
#[command(name = "securerpc-server", about = "Secure RPC transport core server")]
pub struct Args {
    /// WebSocket + unary bind port.
    #[arg(long, env = "SECURERPC_PORT")]
    pub port: Option<u16>,

    /// Log level filter string, e.g. "info" or "securerpc=debug".
    #[arg(long, env = "SECURERPC_LOG")]
    pub log: Option<String>,

    /// Replay-cache TTL in seconds.
    #[arg(long, env = "SECURERPC_REPLAY_TTL_SECS")]
    pub replay_ttl_secs: Option<u64>,

    /// Server-push signing key. Kept configurable rather than hard-coded,
    /// since push traffic is signed with a key distinct from any given
    /// session's derived shared secret.
    #[arg(long, env = "SECURERPC_PUSH_SIGNING_KEY")]
    pub push_signing_key: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct SecureRpcConfig {
    pub port: u16,
    pub log: String,
    /// Acceptable clock skew for the `timestamp` field: ±300s by default.
    pub clock_skew: chrono::Duration,
    /// Replay-cache entry TTL.
    pub replay_ttl: Duration,
    /// Shared-key cache entry TTL.
    pub shared_key_ttl: Duration,
    /// Per-token secret / verified-claims cache TTL.
    pub token_cache_ttl: Duration,
    /// WebSocket heartbeat interval.
    pub ping_interval: Duration,
    /// Heartbeat pong timeout.
    pub ping_timeout: Duration,
    /// Reconnect backoff base.
    pub reconnect_base: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max: Duration,
    /// Maximum reconnect attempts before giving up; `None` = unlimited.
    pub max_reconnect_attempts: Option<u32>,
    /// HMAC key used to sign/verify server push envelopes. Distinct from any
    /// per-connection shared secret, so pushes remain verifiable even to
    /// subscribers that never completed a full ECDH handshake.
    pub push_signing_key: String,
    /// Route prefix used for the WebSocket handshake envelope; the
    /// heartbeat route is `"{connect_path}/ping"`.
    pub connect_path: String,
}

impl Default for SecureRpcConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log: "info".to_string(),
            clock_skew: chrono::Duration::seconds(DEFAULT_SKEW_SECS),
            replay_ttl: Duration::from_secs(DEFAULT_REPLAY_TTL_SECS),
            shared_key_ttl: Duration::from_secs(DEFAULT_SHARED_KEY_TTL_SECS),
            token_cache_ttl: Duration::from_secs(DEFAULT_TOKEN_CACHE_TTL_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(DEFAULT_PING_TIMEOUT_SECS),
            reconnect_base: Duration::from_secs(DEFAULT_RECONNECT_BASE_SECS),
            reconnect_max: Duration::from_secs(DEFAULT_RECONNECT_MAX_SECS),
            max_reconnect_attempts: None,
            push_signing_key: String::new(),
            connect_path: "session.connect".to_string(),
        }
    }
}

impl SecureRpcConfig {
    /// Build a config from parsed CLI args layered over defaults.
    pub fn from_args(args: Args) -> Self {
        let mut cfg = Self::default();
        if let Some(port) = args.port {
            cfg.port = port;
        }
        if let Some(log) = args.log {
            cfg.log = log;
        }
        if let Some(ttl) = args.replay_ttl_secs {
            cfg.replay_ttl = Duration::from_secs(ttl);
        }
        if let Some(key) = args.push_signing_key {
            cfg.push_signing_key = key;
        }
        cfg
    }
}
