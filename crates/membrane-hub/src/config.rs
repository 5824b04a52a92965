//! Hub configuration: defaults with `MEMBRANE_*` environment overrides.

use chrono::Duration as ChronoDuration;
use membrane_bus::economy::{DEFAULT_QUOTE_TTL_SECS, DEFAULT_TENANT_BUDGET};
use membrane_bus::{RateLimitConfig, DEFAULT_PAID_ACTIONS, DEFAULT_SUBSCRIBER_QUEUE};
use membrane_types::{KeyRing, KeyRingError, SignatureSuite, DEFAULT_MAX_PAYLOAD_BYTES};
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Default bus port.
pub const DEFAULT_PORT: u16 = 8765;

/// The only quote registry backend this build ships.
pub const MEMORY_BACKEND: &str = "memory://";

/// Longest quote lifetime the desk may hand out (one day).
pub const MAX_QUOTE_TTL_SECS: i64 = 86_400;

/// Default interval between sweeps of expired quotes and idle buckets.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime configuration of the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub rate_limit: RateLimitConfig,
    pub max_payload_bytes: usize,
    /// Signature suites accepted on inbound envelopes.
    pub signature_suites: Vec<SignatureSuite>,
    pub quote_backend: String,
    /// Verification keys, by origin.
    pub keys: KeyRing,
    /// HMAC secret the hub signs its own envelopes with. Random when unset.
    pub hub_key: Option<Vec<u8>>,
    /// Answer `quote.request` in-process.
    pub quote_desk: bool,
    pub quote_ttl: ChronoDuration,
    pub tenant_budget: f64,
    /// Outbound frames buffered per observe connection.
    pub subscriber_queue: usize,
    pub sweep_interval: Duration,
    /// Channel actions that always require a quote.
    pub paid_actions: Vec<String>,
    /// Origins besides the hub allowed to publish `quote.response`.
    pub economy_origins: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            rate_limit: RateLimitConfig::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            signature_suites: vec![SignatureSuite::HmacSha256, SignatureSuite::Ed25519],
            quote_backend: MEMORY_BACKEND.to_string(),
            keys: KeyRing::new(),
            hub_key: None,
            quote_desk: true,
            quote_ttl: ChronoDuration::seconds(DEFAULT_QUOTE_TTL_SECS),
            tenant_budget: DEFAULT_TENANT_BUDGET,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            paid_actions: DEFAULT_PAID_ACTIONS.iter().map(|a| a.to_string()).collect(),
            economy_origins: Vec::new(),
        }
    }
}

impl HubConfig {
    /// Load from the process environment.
    ///
    /// # Environment Variables
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MEMBRANE_BIND_ADDR` | `0.0.0.0` |
    /// | `MEMBRANE_PORT` | `8765` |
    /// | `MEMBRANE_RATE_LIMIT_CAPACITY` | `100` |
    /// | `MEMBRANE_RATE_LIMIT_WINDOW_SECS` | `60` |
    /// | `MEMBRANE_MAX_PAYLOAD_BYTES` | `1048576` |
    /// | `MEMBRANE_SIGNATURE_SUITES` | `hmac-sha256,ed25519` |
    /// | `MEMBRANE_QUOTE_BACKEND` | `memory://` |
    /// | `MEMBRANE_KEYS` | empty (`origin=suite:key_id:hex;...`) |
    /// | `MEMBRANE_HUB_KEY` | random |
    /// | `MEMBRANE_QUOTE_DESK` | `true` |
    /// | `MEMBRANE_QUOTE_TTL_SECS` | `300` |
    /// | `MEMBRANE_TENANT_BUDGET` | `100.0` |
    /// | `MEMBRANE_SUBSCRIBER_QUEUE` | `1024` |
    /// | `MEMBRANE_SWEEP_INTERVAL_SECS` | `30` |
    /// | `MEMBRANE_PAID_ACTIONS` | `docs.view.request,docs.generate.request,validation.assessment.request` |
    /// | `MEMBRANE_ECONOMY_ORIGINS` | empty (only the hub issues quotes) |
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for a value that does not parse or fails
    /// [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        if let Some((key, v)) = var("MEMBRANE_BIND_ADDR") {
            config.bind_addr = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_PORT") {
            config.port = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_RATE_LIMIT_CAPACITY") {
            config.rate_limit.capacity = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_RATE_LIMIT_WINDOW_SECS") {
            config.rate_limit.window = Duration::from_secs(parse(key, &v)?);
        }
        if let Some((key, v)) = var("MEMBRANE_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_SIGNATURE_SUITES") {
            config.signature_suites = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    SignatureSuite::parse(s)
                        .ok_or_else(|| ConfigError::invalid(key, s, "unknown signature suite"))
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some((_, v)) = var("MEMBRANE_QUOTE_BACKEND") {
            config.quote_backend = v;
        }
        if let Some((_, v)) = var("MEMBRANE_KEYS") {
            config.keys = KeyRing::parse(&v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_HUB_KEY") {
            let secret =
                hex::decode(&v).map_err(|_| ConfigError::invalid(key, "<redacted>", "not hex"))?;
            config.hub_key = Some(secret);
        }
        if let Some((key, v)) = var("MEMBRANE_QUOTE_DESK") {
            config.quote_desk = parse_flag(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_QUOTE_TTL_SECS") {
            config.quote_ttl = ChronoDuration::try_seconds(parse(key, &v)?)
                .ok_or_else(|| ConfigError::invalid(key, &v, "out of range"))?;
        }
        if let Some((key, v)) = var("MEMBRANE_TENANT_BUDGET") {
            config.tenant_budget = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_SUBSCRIBER_QUEUE") {
            config.subscriber_queue = parse(key, &v)?;
        }
        if let Some((key, v)) = var("MEMBRANE_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(parse(key, &v)?);
        }
        if let Some((_, v)) = var("MEMBRANE_PAID_ACTIONS") {
            config.paid_actions = split_list(&v);
        }
        if let Some((_, v)) = var("MEMBRANE_ECONOMY_ORIGINS") {
            config.economy_origins = split_list(&v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// The first setting that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.capacity == 0 {
            return Err(ConfigError::InvalidRateLimit("capacity cannot be 0".into()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::InvalidRateLimit("window cannot be 0".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::InvalidLimit("max_payload_bytes cannot be 0".into()));
        }
        if self.subscriber_queue == 0 {
            return Err(ConfigError::InvalidLimit("subscriber_queue cannot be 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidLimit("sweep_interval cannot be 0".into()));
        }
        if self.signature_suites.is_empty() {
            return Err(ConfigError::NoSignatureSuites);
        }
        if self.quote_backend != MEMORY_BACKEND {
            return Err(ConfigError::UnsupportedBackend(self.quote_backend.clone()));
        }
        if self.quote_ttl <= ChronoDuration::zero() {
            return Err(ConfigError::InvalidLimit("quote_ttl must be positive".into()));
        }
        if self.quote_ttl.num_seconds() > MAX_QUOTE_TTL_SECS {
            return Err(ConfigError::InvalidLimit(format!(
                "quote_ttl cannot exceed {MAX_QUOTE_TTL_SECS}s"
            )));
        }
        if !self.tenant_budget.is_finite() || self.tenant_budget < 0.0 {
            return Err(ConfigError::InvalidLimit(
                "tenant_budget must be a non-negative number".into(),
            ));
        }
        if matches!(&self.hub_key, Some(key) if key.is_empty()) {
            return Err(ConfigError::InvalidLimit("hub key cannot be empty".into()));
        }
        Ok(())
    }

    /// Bus bind address
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable that does not parse
    #[error("invalid value `{value}` for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    /// Invalid rate limiting configuration
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    /// Invalid size, count or duration
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    #[error("no signature suites allowed")]
    NoSignatureSuites,
    #[error("unsupported quote backend `{0}` (only memory:// is available)")]
    UnsupportedBackend(String),
    #[error("invalid key ring: {0}")]
    KeyRing(#[from] KeyRingError),
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(var, value, e.to_string()))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<HubConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HubConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8765");
        assert_eq!(config.rate_limit.capacity, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.signature_suites.len(), 2);
        assert!(config.quote_desk);
        assert!(config.keys.is_empty());
        assert!(config.hub_key.is_none());
        assert_eq!(config.paid_actions.len(), 3);
        assert!(config.economy_origins.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("MEMBRANE_BIND_ADDR", "127.0.0.1"),
            ("MEMBRANE_PORT", "9000"),
            ("MEMBRANE_RATE_LIMIT_CAPACITY", "5"),
            ("MEMBRANE_SIGNATURE_SUITES", "ed25519"),
            ("MEMBRANE_KEYS", "l3.docs=hmac-sha256:k1:736563726574"),
            ("MEMBRANE_HUB_KEY", "00ff"),
            ("MEMBRANE_QUOTE_DESK", "off"),
            ("MEMBRANE_PAID_ACTIONS", "docs.view.request, ,graph.query.request"),
            ("MEMBRANE_ECONOMY_ORIGINS", "l4.economy"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr().to_string(), "127.0.0.1:9000");
        assert_eq!(config.rate_limit.capacity, 5);
        assert_eq!(config.signature_suites, vec![SignatureSuite::Ed25519]);
        assert_eq!(config.keys.len(), 1);
        assert_eq!(config.hub_key, Some(vec![0x00, 0xff]));
        assert!(!config.quote_desk);
        assert_eq!(
            config.paid_actions,
            vec!["docs.view.request".to_string(), "graph.query.request".to_string()]
        );
        assert_eq!(config.economy_origins, vec!["l4.economy".to_string()]);
    }

    #[test]
    fn test_only_memory_backend() {
        assert_eq!(
            load(&[("MEMBRANE_QUOTE_BACKEND", "redis://localhost")]).unwrap_err(),
            ConfigError::UnsupportedBackend("redis://localhost".into())
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            load(&[("MEMBRANE_PORT", "eighty")]),
            Err(ConfigError::InvalidValue { var: "MEMBRANE_PORT", .. })
        ));
        assert!(matches!(
            load(&[("MEMBRANE_RATE_LIMIT_CAPACITY", "0")]),
            Err(ConfigError::InvalidRateLimit(_))
        ));
        assert!(matches!(
            load(&[("MEMBRANE_SIGNATURE_SUITES", "rsa")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            load(&[("MEMBRANE_KEYS", "nonsense")]),
            Err(ConfigError::KeyRing(_))
        ));
        assert!(matches!(
            load(&[("MEMBRANE_TENANT_BUDGET", "-1")]),
            Err(ConfigError::InvalidLimit(_))
        ));
    }

    #[test]
    fn test_quote_ttl_bounds() {
        assert_eq!(
            load(&[("MEMBRANE_QUOTE_TTL_SECS", "60")]).unwrap().quote_ttl,
            ChronoDuration::seconds(60)
        );
        assert!(matches!(
            load(&[("MEMBRANE_QUOTE_TTL_SECS", "9223372036854775807")]),
            Err(ConfigError::InvalidValue { var: "MEMBRANE_QUOTE_TTL_SECS", .. })
        ));
        assert!(matches!(
            load(&[("MEMBRANE_QUOTE_TTL_SECS", "86401")]),
            Err(ConfigError::InvalidLimit(_))
        ));
        assert!(matches!(
            load(&[("MEMBRANE_QUOTE_TTL_SECS", "0")]),
            Err(ConfigError::InvalidLimit(_))
        ));
    }
}
