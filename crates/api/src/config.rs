//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use processors::QuietHours;

/// How a payment gateway signs its webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// Signature and timestamp in separate headers; HMAC over `"{timestamp}.{body}"`.
    TimestampedHeaders,
    /// One `t=<ts>,v1=<hex>` header; HMAC over `"{t}.{body}"`.
    SignedPayload,
}

impl FromStr for SignatureScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamped_headers" => Ok(SignatureScheme::TimestampedHeaders),
            "signed_payload" => Ok(SignatureScheme::SignedPayload),
            other => Err(format!("unknown signature scheme `{other}`")),
        }
    }
}

/// A payment gateway allowed to post webhooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub name: String,
    pub scheme: SignatureScheme,
    pub secret: String,
}

impl GatewayConfig {
    /// Header carrying the signature, e.g. `stripe-signature`.
    pub fn signature_header(&self) -> String {
        format!("{}-signature", self.name)
    }

    /// Header carrying the timestamp for [`SignatureScheme::TimestampedHeaders`].
    pub fn timestamp_header(&self) -> String {
        format!("{}-timestamp", self.name)
    }
}

impl FromStr for GatewayConfig {
    type Err = String;

    /// Parses `name:scheme:secret`. The secret may itself contain colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, ':');
        let (Some(name), Some(scheme), Some(secret)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected name:scheme:secret, got `{s}`"));
        };
        if name.is_empty() || secret.is_empty() {
            return Err(format!("empty gateway name or secret in `{s}`"));
        }
        Ok(Self {
            name: name.to_ascii_lowercase(),
            scheme: scheme.parse()?,
            secret: secret.to_string(),
        })
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for plain text
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory stores when unset
/// - `MESSAGING_APP_SECRET`, `MESSAGING_VERIFY_TOKEN`: messaging webhook credentials
/// - `PAYMENT_GATEWAYS`: comma-separated `name:scheme:secret` entries
/// - `REPLAY_WINDOW_SECS`: accepted webhook timestamp skew (default 300)
/// - `WORKER_CONCURRENCY`, `WORKER_POLL_MS`: job worker sizing
/// - `CIRCUIT_FAILURE_THRESHOLD`, `CIRCUIT_COOLDOWN_SECS`: breaker tuning
/// - `RETRY_BASE_DELAY_SECS`, `RETRY_MAX_DELAY_SECS`: retry backoff bounds
/// - `QUIET_HOURS` (`HH:MM-HH:MM`), `QUIET_HOURS_UTC_OFFSET_MINUTES`
/// - `ALERT_WINDOW_SECS`: minimum spacing of repeated operator alerts
/// - `SAGA_STEP_TIMEOUT_MS`: per-step checkout timeout
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_json: bool,
    pub database_url: Option<String>,
    pub messaging_app_secret: Option<String>,
    pub messaging_verify_token: Option<String>,
    pub payment_gateways: Vec<GatewayConfig>,
    pub replay_window: Duration,
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub quiet_hours: Option<QuietHours>,
    pub alert_window: Duration,
    pub saga_step_timeout: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Unparseable values are logged and replaced by their default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let quiet_hours = env("QUIET_HOURS").and_then(|raw| match raw.parse::<QuietHours>() {
            Ok(q) => Some(q.with_offset_minutes(parse_or("QUIET_HOURS_UTC_OFFSET_MINUTES", 0))),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring QUIET_HOURS");
                None
            }
        });

        Self {
            host: env("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", defaults.port),
            log_level: env("RUST_LOG").unwrap_or(defaults.log_level),
            log_json: env("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            database_url: env("DATABASE_URL"),
            messaging_app_secret: env("MESSAGING_APP_SECRET"),
            messaging_verify_token: env("MESSAGING_VERIFY_TOKEN"),
            payment_gateways: env("PAYMENT_GATEWAYS")
                .map(|raw| parse_gateways(&raw))
                .unwrap_or_default(),
            replay_window: secs_or("REPLAY_WINDOW_SECS", defaults.replay_window),
            worker_concurrency: parse_or("WORKER_CONCURRENCY", defaults.worker_concurrency).max(1),
            worker_poll_interval: env("WORKER_POLL_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.worker_poll_interval),
            circuit_failure_threshold: parse_or(
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            ),
            circuit_cooldown: secs_or("CIRCUIT_COOLDOWN_SECS", defaults.circuit_cooldown),
            retry_base_delay: secs_or("RETRY_BASE_DELAY_SECS", defaults.retry_base_delay),
            retry_max_delay: secs_or("RETRY_MAX_DELAY_SECS", defaults.retry_max_delay),
            quiet_hours,
            alert_window: secs_or("ALERT_WINDOW_SECS", defaults.alert_window),
            saga_step_timeout: env("SAGA_STEP_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.saga_step_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Looks up a configured payment gateway by name.
    pub fn gateway(&self, name: &str) -> Option<&GatewayConfig> {
        self.payment_gateways
            .iter()
            .find(|g| g.name.eq_ignore_ascii_case(name))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_json: false,
            database_url: None,
            messaging_app_secret: None,
            messaging_verify_token: None,
            payment_gateways: Vec::new(),
            replay_window: Duration::from_secs(300),
            worker_concurrency: 4,
            worker_poll_interval: Duration::from_millis(500),
            circuit_failure_threshold: 5,
            circuit_cooldown: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(3600),
            quiet_hours: None,
            alert_window: Duration::from_secs(15 * 60),
            saga_step_timeout: saga::DEFAULT_STEP_TIMEOUT,
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "invalid value, using default");
            default
        }),
        None => default,
    }
}

fn secs_or(key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(key, default.as_secs()))
}

fn parse_gateways(raw: &str) -> Vec<GatewayConfig> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(gateway) => Some(gateway),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring payment gateway entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.replay_window, Duration::from_secs(300));
        assert!(config.payment_gateways.is_empty());
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_gateway_list_parsing() {
        let gateways =
            parse_gateways("Stripe:signed_payload:whsec:abc, adyen:timestamped_headers:s3cret,bad");
        assert_eq!(gateways.len(), 2);
        assert_eq!(gateways[0].name, "stripe");
        assert_eq!(gateways[0].scheme, SignatureScheme::SignedPayload);
        assert_eq!(gateways[0].secret, "whsec:abc");
        assert_eq!(gateways[1].signature_header(), "adyen-signature");
        assert_eq!(gateways[1].timestamp_header(), "adyen-timestamp");

        assert!("x:hmac:secret".parse::<GatewayConfig>().is_err());
        assert!("x:signed_payload:".parse::<GatewayConfig>().is_err());
    }

    #[test]
    fn test_gateway_lookup_ignores_case() {
        let config = Config {
            payment_gateways: parse_gateways("stripe:signed_payload:k"),
            ..Default::default()
        };
        assert!(config.gateway("STRIPE").is_some());
        assert!(config.gateway("paypal").is_none());
    }
}
