//! Configuration management
//!
//! Sources are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `SIPFLOW__*` environment variables.

use crate::domain::shared::error::SipError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub timers: TimerConfig,
    pub refresher: RefresherConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub registration: Option<RegistrationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Address advertised in Via and Contact; defaults to the bind address
    pub via_host: Option<String>,
    pub user_agent: String,
}

/// RFC3261 timer values, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    pub timer_d_ms: u64,
    /// How long a terminated transaction stays around to absorb retransmissions
    pub transaction_linger_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    /// Share of the granted expiry kept as margin before renewing
    pub safety_margin_ratio: f64,
    /// Delay before retrying a failed renewal; no retry when unset
    pub retry_after_ms: Option<u64>,
    pub initial_io_error_retry_ms: u64,
    pub timeout_retry_ms: u64,
    /// Upper bound of the random delay used after a 491
    pub max_conflict_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus scrape address, e.g. `0.0.0.0:9100`
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    pub registrar: String,
    pub aor: String,
    pub contact: Option<String>,
    #[serde(default = "default_register_expires")]
    pub expires: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
}

fn default_register_expires() -> u32 {
    600
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5060,
            via_host: None,
            user_agent: format!("sipflow/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            timer_d_ms: 32_000,
            transaction_linger_ms: 5_000,
        }
    }
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            safety_margin_ratio: 0.1,
            retry_after_ms: None,
            initial_io_error_retry_ms: 500,
            timeout_retry_ms: 2_000,
            max_conflict_retry_ms: 10_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl SipConfig {
    /// `host:port` written into Via sent-by and default Contacts
    pub fn sent_by(&self) -> String {
        let host = self.via_host.as_deref().unwrap_or(&self.bind_address);
        format!("{}:{}", host, self.bind_port)
    }
}

impl TimerConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }

    pub fn timer_d(&self) -> Duration {
        Duration::from_millis(self.timer_d_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.transaction_linger_ms)
    }
}

impl Config {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, SipError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SIPFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SipError::ConfigurationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, SipError> {
        let config: Config =
            toml::from_str(text).map_err(|e| SipError::ConfigurationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SipError> {
        if self.timers.t1_ms == 0 {
            return Err(SipError::ConfigurationError(
                "timers.t1_ms must be positive".to_string(),
            ));
        }
        if self.timers.t2_ms < self.timers.t1_ms {
            return Err(SipError::ConfigurationError(
                "timers.t2_ms must not be below t1_ms".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.refresher.safety_margin_ratio) {
            return Err(SipError::ConfigurationError(
                "refresher.safety_margin_ratio must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_rfc3261() {
        let config = Config::default();
        assert_eq!(config.timers.t1(), Duration::from_millis(500));
        assert_eq!(config.timers.t2(), Duration::from_secs(4));
        assert_eq!(config.timers.t4(), Duration::from_secs(5));
        assert_eq!(config.timers.timer_d(), Duration::from_secs(32));
        assert!(config.refresher.retry_after_ms.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = Config::from_toml_str(
            r#"
            [sip]
            bind_port = 5070
            via_host = "192.0.2.10"

            [timers]
            t1_ms = 250

            [refresher]
            retry_after_ms = 30000

            [registration]
            registrar = "sip:registrar.example.com"
            aor = "sip:alice@example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.sip.sent_by(), "192.0.2.10:5070");
        assert_eq!(config.timers.t1_ms, 250);
        assert_eq!(config.timers.t2_ms, 4_000);
        assert_eq!(config.refresher.retry_after_ms, Some(30_000));
        let registration = config.registration.unwrap();
        assert_eq!(registration.expires, 600);
    }

    #[test]
    fn test_invalid_margin_rejected() {
        let result = Config::from_toml_str("[refresher]\nsafety_margin_ratio = 1.5\n");
        assert!(matches!(result, Err(SipError::ConfigurationError(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.sip.bind_port, 5060);
    }
}
