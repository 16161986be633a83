use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Bus subjects the bridge consumes from and publishes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusSubjects {
    pub lifecycle: String,
    pub command: String,
    pub outbound: String,
}

/// Where the vendor HTTP API lives and how the bridge presents itself to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VendorSettings {
    pub api_base: String,
    pub app_origin: String,
    pub site_id: u64,
}

/// Timing of the per-session handshake and keepalive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub socket_path: String,
    pub subscribe_delay: Duration,
    pub auth_delay: Duration,
    pub canned_phrases_delay: Duration,
    pub keepalive_interval: Duration,
    /// Keepalive intervals without a pong before the connection is considered dead.
    pub max_missed_pongs: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            socket_path: "/cometan".to_string(),
            subscribe_delay: Duration::from_millis(1_000),
            auth_delay: Duration::from_millis(2_000),
            canned_phrases_delay: Duration::from_millis(10_000),
            keepalive_interval: Duration::from_millis(10_000),
            max_missed_pongs: 3,
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub nats_url: String,
    pub subjects: BusSubjects,
    pub vendor: VendorSettings,
    pub session: SessionSettings,
    pub log_level: Level,
}

fn var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn millis_var(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(key, default.as_millis() as u64).map(Duration::from_millis)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let database_url = std::env::var("DATABASE_URL")
            .map(SecretString::from)
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let nats_url = var_or("NATS_URL", "nats://127.0.0.1:4222");

        let subjects = BusSubjects {
            lifecycle: var_or("BUS_LIFECYCLE_SUBJECT", "erp_chat_manager_status"),
            command: var_or("BUS_COMMAND_SUBJECT", "erp_chat_manager_command"),
            outbound: var_or("BUS_OUTBOUND_SUBJECT", "chat_to_erp_handle_messages"),
        };

        let site_id_str = std::env::var("VENDOR_SITE_ID")
            .map_err(|_| ConfigError::MissingVar("VENDOR_SITE_ID".to_string()))?;
        let site_id = site_id_str
            .parse::<u64>()
            .map_err(|e| ConfigError::InvalidValue("VENDOR_SITE_ID".to_string(), e.to_string()))?;
        let vendor = VendorSettings {
            api_base: var_or("VENDOR_API_BASE", "https://api.jivosite.com")
                .trim_end_matches('/')
                .to_string(),
            app_origin: var_or("VENDOR_APP_ORIGIN", "https://app.jivosite.com"),
            site_id,
        };

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            socket_path: var_or("CHAT_SOCKET_PATH", &defaults.socket_path),
            subscribe_delay: millis_var("SUBSCRIBE_DELAY_MS", defaults.subscribe_delay)?,
            auth_delay: millis_var("AUTH_DELAY_MS", defaults.auth_delay)?,
            canned_phrases_delay: millis_var(
                "CANNED_PHRASES_DELAY_MS",
                defaults.canned_phrases_delay,
            )?,
            keepalive_interval: millis_var("KEEPALIVE_INTERVAL_MS", defaults.keepalive_interval)?,
            max_missed_pongs: parse_var("MAX_MISSED_PONGS", defaults.max_missed_pongs)?,
        };
        if session.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "KEEPALIVE_INTERVAL_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            database_url,
            nats_url,
            subjects,
            vendor,
            session,
            log_level,
        })
    }
}
