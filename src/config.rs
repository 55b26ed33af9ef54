//! Configuration types, loaded from `INTAKE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::calendar::{parse_day, parse_offset, south_africa_offset};

/// Read and parse an optional env var, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ── Pipeline ────────────────────────────────────────────────────────

/// Tunables for a processing run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Offset used to compute the default target day.
    pub reference_offset: FixedOffset,
    pub min_attachment_bytes: u64,
    pub max_attachment_bytes: u64,
    /// How far back the duplicate check looks.
    pub dedup_window: Duration,
    /// Attachments worked on at once within a single message.
    pub extraction_concurrency: usize,
    /// Overall run budget. No new message starts once it is spent.
    pub run_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/intake.db"),
            reference_offset: south_africa_offset(),
            min_attachment_bytes: 5 * 1024,
            max_attachment_bytes: 15 * 1024 * 1024,
            dedup_window: Duration::from_secs(24 * 3600),
            extraction_concurrency: 1,
            run_deadline: Duration::from_secs(840), // 14 minutes
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let reference_offset = match env_opt("INTAKE_REFERENCE_TZ") {
            Some(raw) => parse_offset(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "INTAKE_REFERENCE_TZ".into(),
                message: format!("'{raw}' is not a UTC offset"),
            })?,
            None => defaults.reference_offset,
        };

        let dedup_hours: u64 = env_or("INTAKE_DEDUP_WINDOW_HOURS", 24)?;
        let deadline_secs: u64 = env_or("INTAKE_RUN_DEADLINE_SECS", 840)?;
        let concurrency: usize = env_or("INTAKE_EXTRACTION_CONCURRENCY", 1)?;

        let config = Self {
            db_path: env_opt("INTAKE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            reference_offset,
            min_attachment_bytes: env_or("INTAKE_MIN_ATTACHMENT_BYTES", defaults.min_attachment_bytes)?,
            max_attachment_bytes: env_or("INTAKE_MAX_ATTACHMENT_BYTES", defaults.max_attachment_bytes)?,
            dedup_window: Duration::from_secs(dedup_hours * 3600),
            extraction_concurrency: concurrency.max(1),
            run_deadline: Duration::from_secs(deadline_secs),
        };

        if config.min_attachment_bytes > config.max_attachment_bytes {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_MIN_ATTACHMENT_BYTES".into(),
                message: "must not exceed INTAKE_MAX_ATTACHMENT_BYTES".into(),
            });
        }
        Ok(config)
    }
}

// ── Extraction ──────────────────────────────────────────────────────

/// Anthropic Messages API settings.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub api_key: SecretString,
    pub model: String,
    pub max_tokens: u32,
    /// Per-call timeout.
    pub timeout: Duration,
}

impl ExtractionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_opt("ANTHROPIC_API_KEY")
            .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
        let timeout_secs: u64 = env_or("INTAKE_EXTRACTION_TIMEOUT_SECS", 120)?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: env_opt("INTAKE_EXTRACTION_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-20250514".to_string()),
            max_tokens: env_or("INTAKE_EXTRACTION_MAX_TOKENS", 2048)?,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

// ── Mail backends ───────────────────────────────────────────────────

/// Which mail source to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailBackend {
    Imap,
    Gmail,
}

impl FromStr for MailBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "imap" => Ok(Self::Imap),
            "gmail" => Ok(Self::Gmail),
            other => Err(format!("unknown mail backend '{other}' (expected imap or gmail)")),
        }
    }
}

/// IMAP account that receives mail for every route address.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
}

impl ImapConfig {
    /// Returns `None` when `INTAKE_IMAP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let host = env_opt("INTAKE_IMAP_HOST")?;

        let port: u16 = std::env::var("INTAKE_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        Some(Self {
            host,
            port,
            username: std::env::var("INTAKE_IMAP_USERNAME").unwrap_or_default(),
            password: SecretString::from(std::env::var("INTAKE_IMAP_PASSWORD").unwrap_or_default()),
            mailbox: env_opt("INTAKE_IMAP_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
        })
    }
}

/// Gmail REST credentials. The token must carry the `gmail.readonly` scope.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub access_token: SecretString,
    pub api_base: String,
}

impl GmailConfig {
    pub fn from_env() -> Option<Self> {
        let token = env_opt("INTAKE_GMAIL_ACCESS_TOKEN")?;
        Some(Self {
            access_token: SecretString::from(token),
            api_base: env_opt("INTAKE_GMAIL_API_BASE")
                .unwrap_or_else(|| "https://gmail.googleapis.com/gmail/v1".to_string()),
        })
    }
}

// ── Process ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// HTTP trigger server, plus the cron ticker when configured.
    Serve,
    /// Single run for one day, report printed to stdout.
    Once,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serve" => Ok(Self::Serve),
            "once" => Ok(Self::Once),
            other => Err(format!("unknown mode '{other}' (expected serve or once)")),
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: RunMode,
    pub mail_backend: MailBackend,
    pub target_day: Option<NaiveDate>,
    pub cron: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let target_day = match env_opt("INTAKE_TARGET_DAY") {
            Some(raw) => Some(parse_day(&raw).map_err(|e| ConfigError::InvalidValue {
                key: "INTAKE_TARGET_DAY".into(),
                message: e.to_string(),
            })?),
            None => None,
        };

        Ok(Self {
            port: env_or("INTAKE_HTTP_PORT", 8080)?,
            mode: env_or("INTAKE_MODE", RunMode::Serve)?,
            mail_backend: env_or("INTAKE_MAIL_BACKEND", MailBackend::Imap)?,
            target_day,
            cron: env_opt("INTAKE_CRON"),
            log_dir: env_opt("INTAKE_LOG_DIR").map(PathBuf::from),
        })
    }
}
