//! Runtime configuration, read from environment variables at process start.

use anyhow::{Context, Result, bail};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DATE_TOKEN: &str = "{date}";

const DEFAULT_CHUNK_SIZE: usize = 50;
const DEFAULT_CHUNK_DELAY_MS: u64 = 200;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_BACKOFF_MULTIPLIER: u32 = 2;
const DEFAULT_MAX_BACKOFF_DELAY_MS: u64 = 10_000;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_GREETING_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_SUBJECT_TEMPLATE: &str = "Newsletter {date}";

/// Pacing and retry knobs for the delivery pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_backoff_multiplier: u32,
    pub max_backoff_delay: Duration,
    pub subject_template: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(DEFAULT_CHUNK_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            max_backoff_delay: Duration::from_millis(DEFAULT_MAX_BACKOFF_DELAY_MS),
            subject_template: DEFAULT_SUBJECT_TEMPLATE.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            chunk_size: env_or("CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            chunk_delay: env_millis("CHUNK_DELAY_MS", DEFAULT_CHUNK_DELAY_MS)?,
            max_retries: env_or("MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            retry_delay: env_millis("RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?,
            retry_backoff_multiplier: env_or(
                "RETRY_BACKOFF_MULTIPLIER",
                DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            )?,
            max_backoff_delay: env_millis("MAX_BACKOFF_DELAY_MS", DEFAULT_MAX_BACKOFF_DELAY_MS)?,
            subject_template: optional_env("SUBJECT_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_SUBJECT_TEMPLATE.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            bail!("CHUNK_SIZE must be at least 1");
        }
        if self.max_retries == 0 {
            bail!("MAX_RETRIES must be at least 1");
        }
        if self.retry_backoff_multiplier == 0 {
            bail!("RETRY_BACKOFF_MULTIPLIER must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    StartTls,
    Tls,
    None,
}

impl FromStr for SmtpSecurity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" => Ok(Self::Tls),
            "none" => Ok(Self::None),
            other => bail!("Invalid SMTP_SECURITY value: {}", other),
        }
    }
}

/// Connection settings handed to the transport factory for every chunk.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub security: SmtpSecurity,
    pub connection_timeout: Duration,
    pub greeting_timeout: Duration,
    pub socket_timeout: Duration,
}

impl SmtpSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: required_env("SMTP_HOST")?,
            port: env_or("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            username: optional_env("SMTP_USERNAME"),
            password: optional_env("SMTP_PASSWORD"),
            security: env_or("SMTP_SECURITY", SmtpSecurity::StartTls)?,
            connection_timeout: env_millis(
                "SMTP_CONNECTION_TIMEOUT_MS",
                DEFAULT_CONNECTION_TIMEOUT_MS,
            )?,
            greeting_timeout: env_millis("SMTP_GREETING_TIMEOUT_MS", DEFAULT_GREETING_TIMEOUT_MS)?,
            socket_timeout: env_millis("SMTP_SOCKET_TIMEOUT_MS", DEFAULT_SOCKET_TIMEOUT_MS)?,
        })
    }
}

/// Who the newsletter is from.
#[derive(Debug, Clone)]
pub struct SenderIdentity {
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to_email: Option<String>,
}

impl SenderIdentity {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            from_email: required_env("EMAIL_FROM")?,
            from_name: optional_env("EMAIL_FROM_NAME"),
            reply_to_email: optional_env("EMAIL_REPLY_TO"),
        })
    }

    /// `Name <address>` when a display name is configured, the bare address otherwise.
    pub fn mailbox(&self) -> String {
        match &self.from_name {
            Some(name) => format!("{} <{}>", name, self.from_email),
            None => self.from_email.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub operator_email: String,
    pub from_email: String,
    pub configuration_set: Option<String>,
}

impl NotifierConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            operator_email: required_env("OPERATOR_EMAIL")?,
            from_email: required_env("EMAIL_FROM")?,
            configuration_set: optional_env("SES_CONFIGURATION_SET"),
        })
    }
}

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} environment variable must be set", name))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has an invalid value '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}

fn env_millis(name: &str, default_ms: u64) -> Result<Duration> {
    env_or(name, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.chunk_delay, Duration::from_millis(200));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(1_000));
        assert_eq!(config.retry_backoff_multiplier, 2);
        assert_eq!(config.max_backoff_delay, Duration::from_millis(10_000));
        assert!(config.subject_template.contains(DATE_TOKEN));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let config = PipelineConfig {
            chunk_size: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_max_retries() {
        let config = PipelineConfig {
            max_retries: 0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn smtp_security_parses_case_insensitively() {
        assert_eq!("STARTTLS".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::StartTls);
        assert_eq!("ssl".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::Tls);
        assert_eq!("none".parse::<SmtpSecurity>().unwrap(), SmtpSecurity::None);
        assert!("plaintext".parse::<SmtpSecurity>().is_err());
    }

    #[test]
    fn sender_mailbox_includes_display_name() {
        let sender = SenderIdentity {
            from_email: "news@example.com".to_string(),
            from_name: Some("Example News".to_string()),
            reply_to_email: None,
        };
        assert_eq!(sender.mailbox(), "Example News <news@example.com>");

        let bare = SenderIdentity {
            from_name: None,
            ..sender
        };
        assert_eq!(bare.mailbox(), "news@example.com");
    }
}
