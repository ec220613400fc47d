// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning variables in
// `db::pool`; this module covers the server and the real-time core.

use std::net::SocketAddr;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "huddle_local_development_jwt_secret_must_be_32_chars";

/// The online-users request interval is clamped to this range.
pub const MIN_ONLINE_USERS_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_ONLINE_USERS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Timing and size knobs of the real-time core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// How long a call may ring before it is marked missed.
    pub ring_timeout: Duration,
    /// Period of the ongoing-call participant monitor.
    pub call_monitor_interval: Duration,
    /// Period of the background sweep.
    pub cleanup_interval: Duration,
    /// Ringing calls older than this are reaped by the sweep.
    pub stale_ringing_after: Duration,
    /// Minimum spacing between presence broadcasts for one user.
    pub presence_throttle: Duration,
    /// Minimum spacing between `get_online_users` answers per connection.
    pub online_users_interval: Duration,
    /// Largest serialized document mutation the merge engine accepts.
    pub max_doc_payload_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            call_monitor_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(30),
            stale_ringing_after: Duration::from_secs(60),
            presence_throttle: Duration::from_millis(5_000),
            online_users_interval: Duration::from_millis(5_000),
            max_doc_payload_bytes: 1_000_000,
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT verification secret for access tokens.
    pub jwt_secret: String,
    /// PostgreSQL connection string. Without one the relay keeps state in memory.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `huddle_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    pub core: CoreConfig,
    /// Values that were present but unusable, reported once logging is up.
    pub warnings: Vec<String>,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HUDDLE_RELAY_HOST` | `0.0.0.0` |
    /// | `HUDDLE_RELAY_PORT` | `8080` |
    /// | `HUDDLE_RELAY_JWT_SECRET` | dev-only placeholder |
    /// | `HUDDLE_RELAY_DATABASE_URL` | *(none, in-memory stores)* |
    /// | `HUDDLE_RELAY_LOG_FILTER` | `info` |
    /// | `HUDDLE_RELAY_LOG_FORMAT` | `text` (`json` for structured output) |
    /// | `HUDDLE_RELAY_RING_TIMEOUT_SECS` | `30` |
    /// | `HUDDLE_RELAY_CALL_MONITOR_INTERVAL_SECS` | `5` |
    /// | `HUDDLE_RELAY_CLEANUP_INTERVAL_SECS` | `30` |
    /// | `HUDDLE_RELAY_STALE_RINGING_SECS` | `60` |
    /// | `HUDDLE_RELAY_PRESENCE_THROTTLE_MS` | `5000` |
    /// | `HUDDLE_RELAY_ONLINE_USERS_INTERVAL_MS` | `5000` (clamped to 2000..=10000) |
    /// | `HUDDLE_RELAY_MAX_DOC_PAYLOAD_BYTES` | `1000000` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let mut warnings = Vec::new();

        let host = env("HUDDLE_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port = parse_positive(&env, "HUDDLE_RELAY_PORT", 8080u16, &mut warnings);
        let listen_addr = format!("{host}:{port}").parse().unwrap_or_else(|_| {
            warnings.push(format!("HUDDLE_RELAY_HOST={host} is not an IP address; using 0.0.0.0"));
            SocketAddr::from(([0, 0, 0, 0], port))
        });

        let jwt_secret = env("HUDDLE_RELAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let database_url = env("HUDDLE_RELAY_DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        let log_filter = env("HUDDLE_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("HUDDLE_RELAY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") | Err(_) => LogFormat::Text,
            Ok(other) => {
                warnings.push(format!("HUDDLE_RELAY_LOG_FORMAT={other} is not text|json; using text"));
                LogFormat::Text
            }
        };

        let defaults = CoreConfig::default();
        let online_users_ms = parse_positive(
            &env,
            "HUDDLE_RELAY_ONLINE_USERS_INTERVAL_MS",
            defaults.online_users_interval.as_millis() as u64,
            &mut warnings,
        );
        let core = CoreConfig {
            ring_timeout: Duration::from_secs(parse_positive(
                &env,
                "HUDDLE_RELAY_RING_TIMEOUT_SECS",
                defaults.ring_timeout.as_secs(),
                &mut warnings,
            )),
            call_monitor_interval: Duration::from_secs(parse_positive(
                &env,
                "HUDDLE_RELAY_CALL_MONITOR_INTERVAL_SECS",
                defaults.call_monitor_interval.as_secs(),
                &mut warnings,
            )),
            cleanup_interval: Duration::from_secs(parse_positive(
                &env,
                "HUDDLE_RELAY_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
                &mut warnings,
            )),
            stale_ringing_after: Duration::from_secs(parse_positive(
                &env,
                "HUDDLE_RELAY_STALE_RINGING_SECS",
                defaults.stale_ringing_after.as_secs(),
                &mut warnings,
            )),
            presence_throttle: Duration::from_millis(parse_positive(
                &env,
                "HUDDLE_RELAY_PRESENCE_THROTTLE_MS",
                defaults.presence_throttle.as_millis() as u64,
                &mut warnings,
            )),
            online_users_interval: Duration::from_millis(online_users_ms)
                .clamp(MIN_ONLINE_USERS_INTERVAL, MAX_ONLINE_USERS_INTERVAL),
            max_doc_payload_bytes: parse_positive(
                &env,
                "HUDDLE_RELAY_MAX_DOC_PAYLOAD_BYTES",
                defaults.max_doc_payload_bytes,
                &mut warnings,
            ),
        };

        Self { listen_addr, jwt_secret, database_url, log_filter, log_format, core, warnings }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

/// Reads a strictly positive number. Missing values use the default
/// silently; present but unusable values use it with a warning.
fn parse_positive<F, T>(env: &F, key: &str, default: T, warnings: &mut Vec<String>) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialOrd + Default + std::fmt::Display + Copy,
{
    let Ok(raw) = env(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warnings.push(format!("{key}={raw} is not a positive number; using {default}"));
            default
        }
    }
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
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.core, CoreConfig::default());
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn core_defaults_match_documented_timings() {
        let core = CoreConfig::default();
        assert_eq!(core.ring_timeout, Duration::from_secs(30));
        assert_eq!(core.call_monitor_interval, Duration::from_secs(5));
        assert_eq!(core.cleanup_interval, Duration::from_secs(30));
        assert_eq!(core.stale_ringing_after, Duration::from_secs(60));
        assert_eq!(core.presence_throttle, Duration::from_secs(5));
        assert_eq!(core.max_doc_payload_bytes, 1_000_000);
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_HOST", "127.0.0.1");
        m.insert("HUDDLE_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn blank_database_url_means_memory() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_DATABASE_URL", "  ");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn json_log_format() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_LOG_FORMAT", "json");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn timing_overrides() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_RING_TIMEOUT_SECS", "45");
        m.insert("HUDDLE_RELAY_PRESENCE_THROTTLE_MS", "1500");
        m.insert("HUDDLE_RELAY_MAX_DOC_PAYLOAD_BYTES", "2048");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.core.ring_timeout, Duration::from_secs(45));
        assert_eq!(cfg.core.presence_throttle, Duration::from_millis(1500));
        assert_eq!(cfg.core.max_doc_payload_bytes, 2048);
    }

    #[test]
    fn invalid_or_zero_values_fall_back_with_warning() {
        let mut m = HashMap::new();
        m.insert("HUDDLE_RELAY_PORT", "not_a_number");
        m.insert("HUDDLE_RELAY_RING_TIMEOUT_SECS", "0");
        m.insert("HUDDLE_RELAY_CLEANUP_INTERVAL_SECS", "-5");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.core.ring_timeout, Duration::from_secs(30));
        assert_eq!(cfg.core.cleanup_interval, Duration::from_secs(30));
        assert_eq!(cfg.warnings.len(), 3);
    }

    #[test]
    fn online_users_interval_is_clamped() {
        let mut low = HashMap::new();
        low.insert("HUDDLE_RELAY_ONLINE_USERS_INTERVAL_MS", "100");
        let cfg = RelayConfig::from_env_fn(env_from_map(low));
        assert_eq!(cfg.core.online_users_interval, MIN_ONLINE_USERS_INTERVAL);

        let mut high = HashMap::new();
        high.insert("HUDDLE_RELAY_ONLINE_USERS_INTERVAL_MS", "60000");
        let cfg = RelayConfig::from_env_fn(env_from_map(high));
        assert_eq!(cfg.core.online_users_interval, MAX_ONLINE_USERS_INTERVAL);
    }
}
