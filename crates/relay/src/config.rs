// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Unparseable or zero values fall back to the default.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_AWARENESS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_AWARENESS_SWEEP_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_HEARTBEAT_MISSED_LIMIT: u32 = 2;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `flowsync_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Comma-separated CORS origins, or `"*"` for any.
    pub cors_origins: String,
    /// Presence entries not refreshed within this window are dropped.
    pub awareness_timeout: Duration,
    pub awareness_sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before a connection is dropped.
    pub heartbeat_missed_limit: u32,
    /// Frames buffered per connection before the peer counts as too slow.
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FLOWSYNC_RELAY_HOST` | `0.0.0.0` |
    /// | `FLOWSYNC_RELAY_PORT` | `1234` |
    /// | `FLOWSYNC_RELAY_LOG_FILTER` | `info` |
    /// | `FLOWSYNC_RELAY_LOG_FORMAT` | `text` (or `json`) |
    /// | `FLOWSYNC_RELAY_CORS_ORIGINS` | `*` |
    /// | `FLOWSYNC_RELAY_AWARENESS_TIMEOUT_MS` | `30000` |
    /// | `FLOWSYNC_RELAY_AWARENESS_SWEEP_MS` | `5000` |
    /// | `FLOWSYNC_RELAY_HEARTBEAT_INTERVAL_MS` | `15000` |
    /// | `FLOWSYNC_RELAY_HEARTBEAT_MISSED_LIMIT` | `2` |
    /// | `FLOWSYNC_RELAY_OUTBOUND_QUEUE` | `256` |
    /// | `FLOWSYNC_RELAY_MAX_FRAME_BYTES` | `1048576` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("FLOWSYNC_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_positive(&env, "FLOWSYNC_RELAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("FLOWSYNC_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("FLOWSYNC_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
            Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let cors_origins = env("FLOWSYNC_RELAY_CORS_ORIGINS")
            .ok()
            .filter(|origins| !origins.trim().is_empty())
            .unwrap_or_else(|| "*".into());

        let millis = |key: &str, default: u64| Duration::from_millis(parse_positive(&env, key, default));

        Self {
            listen_addr,
            log_filter,
            log_format,
            cors_origins,
            awareness_timeout: millis(
                "FLOWSYNC_RELAY_AWARENESS_TIMEOUT_MS",
                DEFAULT_AWARENESS_TIMEOUT_MS,
            ),
            awareness_sweep_interval: millis(
                "FLOWSYNC_RELAY_AWARENESS_SWEEP_MS",
                DEFAULT_AWARENESS_SWEEP_MS,
            ),
            heartbeat_interval: millis(
                "FLOWSYNC_RELAY_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            heartbeat_missed_limit: parse_positive(
                &env,
                "FLOWSYNC_RELAY_HEARTBEAT_MISSED_LIMIT",
                DEFAULT_HEARTBEAT_MISSED_LIMIT,
            ),
            outbound_queue: parse_positive(&env, "FLOWSYNC_RELAY_OUTBOUND_QUEUE", DEFAULT_OUTBOUND_QUEUE),
            max_frame_bytes: parse_positive(
                &env,
                "FLOWSYNC_RELAY_MAX_FRAME_BYTES",
                DEFAULT_MAX_FRAME_BYTES,
            ),
        }
    }
}

fn parse_positive<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialEq + Default,
{
    env(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:1234");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.cors_origins, "*");
        assert_eq!(cfg.awareness_timeout, Duration::from_secs(30));
        assert_eq!(cfg.awareness_sweep_interval, Duration::from_secs(5));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat_missed_limit, 2);
        assert_eq!(cfg.outbound_queue, 256);
        assert_eq!(cfg.max_frame_bytes, 1_048_576);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("FLOWSYNC_RELAY_HOST", "127.0.0.1");
        m.insert("FLOWSYNC_RELAY_PORT", "4000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:4000");
    }

    #[test]
    fn json_log_format() {
        let mut m = HashMap::new();
        m.insert("FLOWSYNC_RELAY_LOG_FORMAT", "JSON");
        m.insert("FLOWSYNC_RELAY_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }

    #[test]
    fn timing_overrides() {
        let mut m = HashMap::new();
        m.insert("FLOWSYNC_RELAY_AWARENESS_TIMEOUT_MS", "1000");
        m.insert("FLOWSYNC_RELAY_AWARENESS_SWEEP_MS", "250");
        m.insert("FLOWSYNC_RELAY_HEARTBEAT_INTERVAL_MS", "500");
        m.insert("FLOWSYNC_RELAY_HEARTBEAT_MISSED_LIMIT", "5");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.awareness_timeout, Duration::from_millis(1000));
        assert_eq!(cfg.awareness_sweep_interval, Duration::from_millis(250));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(cfg.heartbeat_missed_limit, 5);
    }

    #[test]
    fn invalid_and_zero_values_use_defaults() {
        let mut m = HashMap::new();
        m.insert("FLOWSYNC_RELAY_PORT", "not_a_number");
        m.insert("FLOWSYNC_RELAY_OUTBOUND_QUEUE", "0");
        m.insert("FLOWSYNC_RELAY_MAX_FRAME_BYTES", "-5");
        m.insert("FLOWSYNC_RELAY_CORS_ORIGINS", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), DEFAULT_PORT);
        assert_eq!(cfg.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
        assert_eq!(cfg.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(cfg.cors_origins, "*");
    }

    #[test]
    fn cors_origin_list_is_kept_verbatim() {
        let mut m = HashMap::new();
        m.insert("FLOWSYNC_RELAY_CORS_ORIGINS", "http://localhost:3000,https://flow.example");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.cors_origins, "http://localhost:3000,https://flow.example");
    }
}
