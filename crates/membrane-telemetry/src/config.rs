//! Telemetry configuration from environment variables.

use std::env;

/// Default service name reported in traces.
pub const DEFAULT_SERVICE_NAME: &str = "membrane-hub";

/// Configuration for logging, tracing and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for traces and logs
    pub service_name: String,

    /// OTLP collector endpoint. Span export is off when unset.
    pub otlp_endpoint: Option<String>,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Deployment environment (development, staging, production)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            json_logs: false,
            environment: "development".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: membrane-hub)
    /// - `MEMBRANE_OTLP_ENDPOINT`: OTLP gRPC endpoint (default: unset, no export)
    /// - `MEMBRANE_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `MEMBRANE_JSON_LOGS`: JSON logs (default: true in containers, else false)
    /// - `MEMBRANE_ENVIRONMENT`: Deployment environment (default: development)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let is_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();

        Self {
            service_name: lookup("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),

            otlp_endpoint: lookup("MEMBRANE_OTLP_ENDPOINT")
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),

            log_level: lookup("MEMBRANE_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            json_logs: lookup("MEMBRANE_JSON_LOGS")
                .map(|v| parse_flag(&v))
                .unwrap_or(is_container),

            environment: lookup("MEMBRANE_ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Whether spans are exported over OTLP.
    pub fn exports_traces(&self) -> bool {
        self.otlp_endpoint.is_some()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.service_name, "membrane-hub");
        assert!(!config.exports_traces());
    }

    #[test]
    fn test_log_level_precedence() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("RUST_LOG", "debug"),
            ("MEMBRANE_LOG_LEVEL", "warn"),
        ]));
        assert_eq!(config.log_level, "warn");

        let config = TelemetryConfig::from_lookup(lookup(&[("RUST_LOG", "debug")]));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_container_defaults_to_json() {
        let config = TelemetryConfig::from_lookup(lookup(&[("KUBERNETES_SERVICE_HOST", "10.0.0.1")]));
        assert!(config.json_logs);

        let config = TelemetryConfig::from_lookup(lookup(&[
            ("DOCKER_CONTAINER", "1"),
            ("MEMBRANE_JSON_LOGS", "false"),
        ]));
        assert!(!config.json_logs);
    }

    #[test]
    fn test_blank_otlp_endpoint_is_off() {
        let config = TelemetryConfig::from_lookup(lookup(&[("MEMBRANE_OTLP_ENDPOINT", "  ")]));
        assert!(!config.exports_traces());

        let config = TelemetryConfig::from_lookup(lookup(&[(
            "MEMBRANE_OTLP_ENDPOINT",
            "http://tempo:4317",
        )]));
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://tempo:4317"));
    }
}
