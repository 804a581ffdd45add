//! Application configuration

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::MessageLimits;

use crate::websocket::durability::DurabilityConfig;
use crate::websocket::presence::PresenceConfig;

/// Which record store backs the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub log_format: LogFormat,

    // Store
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Presence
    pub presence_settle: Duration,
    pub presence_debounce: Duration,
    pub guest_grace: Duration,
    pub sweep_interval: Duration,

    // Messaging
    pub max_body_chars: usize,
    pub durability_queue_capacity: usize,
    pub durability_max_attempts: usize,
    pub durability_backoff: Duration,
    pub lossy_queue_capacity: usize,

    // Attachments
    pub upload_dir: PathBuf,
    pub attachment_retention: Duration,
}

impl Config {
    /// Defaults for everything except the signing secret
    pub fn with_secret(jwt_secret: impl Into<String>) -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            log_format: LogFormat::Text,
            store_backend: StoreBackend::Postgres,
            database_url: None,
            database_max_connections: 10,
            jwt_secret: jwt_secret.into(),
            presence_settle: Duration::from_millis(3000),
            presence_debounce: Duration::from_millis(500),
            guest_grace: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_body_chars: 4000,
            durability_queue_capacity: 1024,
            durability_max_attempts: 3,
            durability_backoff: Duration::from_millis(50),
            lossy_queue_capacity: 32,
            upload_dir: PathBuf::from("./uploads"),
            attachment_retention: Duration::from_secs(168 * 3600),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::WeakSecret(
                "JWT_SECRET must be at least 32 characters",
            ));
        }

        let defaults = Self::with_secret(jwt_secret);

        let store_backend = parse_var("STORE_BACKEND", defaults.store_backend)?;
        let database_url = env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let durability_max_attempts =
            parse_var("DURABILITY_MAX_ATTEMPTS", defaults.durability_max_attempts)?;
        if durability_max_attempts == 0 {
            return Err(ConfigError::Invalid("DURABILITY_MAX_ATTEMPTS"));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            log_format: parse_var("LOG_FORMAT", defaults.log_format)?,

            // Store
            store_backend,
            database_url,
            database_max_connections: parse_var(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,

            // Presence
            presence_settle: millis_var("PRESENCE_SETTLE_MS", defaults.presence_settle)?,
            presence_debounce: millis_var("PRESENCE_DEBOUNCE_MS", defaults.presence_debounce)?,
            guest_grace: secs_var("GUEST_GRACE_SECS", defaults.guest_grace)?,
            sweep_interval: secs_var("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,

            // Messaging
            max_body_chars: parse_var("MAX_BODY_CHARS", defaults.max_body_chars)?,
            durability_queue_capacity: parse_var(
                "DURABILITY_QUEUE_CAPACITY",
                defaults.durability_queue_capacity,
            )?,
            durability_max_attempts,
            durability_backoff: millis_var("DURABILITY_BACKOFF_MS", defaults.durability_backoff)?,
            lossy_queue_capacity: parse_var("LOSSY_QUEUE_CAPACITY", defaults.lossy_queue_capacity)?,

            // Attachments
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            attachment_retention: Duration::from_secs(
                parse_var("ATTACHMENT_RETENTION_HOURS", 168u64)? * 3600,
            ),

            jwt_secret: defaults.jwt_secret,
        })
    }

    pub fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            settle_delay: self.presence_settle,
            debounce_window: self.presence_debounce,
            guest_grace: self.guest_grace,
        }
    }

    pub fn durability(&self) -> DurabilityConfig {
        DurabilityConfig {
            queue_capacity: self.durability_queue_capacity,
            max_attempts: self.durability_max_attempts,
            base_backoff: self.durability_backoff,
        }
    }

    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            max_body_chars: self.max_body_chars,
            ..MessageLimits::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(name, default_ms).map(Duration::from_millis)
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
