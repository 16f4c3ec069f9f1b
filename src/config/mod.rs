use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_HEARTBEAT_SECS: u16 = 600;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
const DEFAULT_EMAIL_FROM: &str = "noreply@localhost";
const DEFAULT_SMTP_PORT: u16 = 465;
const DEFAULT_SMTP_TIMEOUT_SECS: u64 = 30;

/// Broker connection settings shared by publishers and consumers.
#[derive(Debug, Clone)]
pub struct RabbitMqConfig {
    pub url: String,
    pub heartbeat: u16,
    pub connection_timeout: Duration,
    pub connection_name: Option<String>,
    /// How many times a consumer re-establishes a dropped connection before giving up.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl RabbitMqConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: DEFAULT_HEARTBEAT_SECS,
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            connection_name: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        }
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

/// SMTPS relay settings. The password is never printed.
#[derive(Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq: RabbitMqConfig,
    pub service_name: String,
    pub rust_log: String,
    pub metrics_port: u16,
    /// Time an in-flight handler gets to finish once shutdown is requested.
    pub shutdown_grace: Duration,
    pub email_from: String,
    /// `None` when `SMTP_SERVER` is unset: emails are logged instead of sent.
    pub smtp: Option<SmtpConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rabbitmq_url =
            lookup("RABBITMQ_URL").ok_or(ConfigError::MissingRequired("RABBITMQ_URL"))?;

        let service_name =
            lookup("SERVICE_NAME").ok_or(ConfigError::MissingRequired("SERVICE_NAME"))?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let heartbeat = parse_or(&lookup, "RABBITMQ_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)?;
        let connection_timeout = parse_or(
            &lookup,
            "RABBITMQ_CONNECTION_TIMEOUT_SECS",
            DEFAULT_CONNECTION_TIMEOUT_SECS,
        )?;
        let reconnect_attempts = parse_or(
            &lookup,
            "RABBITMQ_RECONNECT_ATTEMPTS",
            DEFAULT_RECONNECT_ATTEMPTS,
        )?;
        let reconnect_delay_ms = parse_or(
            &lookup,
            "RABBITMQ_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?;
        let metrics_port = parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?;
        let shutdown_grace_secs =
            parse_or(&lookup, "SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)?;
        let email_from = lookup("EMAIL_FROM").unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string());

        let smtp = match lookup("SMTP_SERVER").filter(|server| !server.trim().is_empty()) {
            None => None,
            Some(server) => Some(SmtpConfig {
                server: server.trim().to_string(),
                port: parse_or(&lookup, "SMTP_PORT", DEFAULT_SMTP_PORT)?,
                username: lookup("SMTP_USERNAME").unwrap_or_else(|| email_from.clone()),
                password: lookup("SMTP_PASSWORD")
                    .ok_or(ConfigError::MissingRequired("SMTP_PASSWORD"))?,
                timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "SMTP_TIMEOUT_SECS",
                    DEFAULT_SMTP_TIMEOUT_SECS,
                )?),
            }),
        };

        let rabbitmq = RabbitMqConfig {
            url: rabbitmq_url,
            heartbeat,
            connection_timeout: Duration::from_secs(connection_timeout),
            connection_name: Some(service_name.clone()),
            reconnect_attempts,
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
        };

        Ok(Self {
            rabbitmq,
            service_name,
            rust_log,
            metrics_port,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            email_from,
            smtp,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name: key,
            value: raw,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for environment variable {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
