//! Runtime configuration loaded from `GALLEY_*` environment variables.
//! Unset or invalid values fall back to defaults and are logged, never fatal.

use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::identity::{ExpiryPolicy, MissingExp};

pub const DEFAULT_API_BASE: &str = "http://localhost:3006/api/v1";
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 30;
pub const DEFAULT_SESSION_FILE: &str = ".galley/session.json";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: Url,
    pub expiry: ExpiryPolicy,
    pub session_file: PathBuf,
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: parse_base(DEFAULT_API_BASE).expect("default API base is a valid URL"),
            expiry: ExpiryPolicy::default(),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let defaults = Self::default();
        let api_base = match env::var("GALLEY_API_BASE") {
            Ok(raw) => parse_base(&raw).unwrap_or_else(|e| {
                warn!(target: "galley::config", "GALLEY_API_BASE '{}' invalid ({}), using {}", raw, e, defaults.api_base);
                defaults.api_base.clone()
            }),
            Err(_) => defaults.api_base.clone(),
        };
        let buffer_secs = try_load("GALLEY_REFRESH_BUFFER_SECS", DEFAULT_REFRESH_BUFFER_SECS);
        let missing_exp = try_load("GALLEY_MISSING_EXP", MissingExp::NeverExpires);
        let session_file = env::var("GALLEY_SESSION_FILE").map(PathBuf::from).unwrap_or(defaults.session_file);
        let timeout_secs = try_load("GALLEY_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS);
        Self {
            api_base,
            expiry: ExpiryPolicy { buffer_secs, missing_exp },
            session_file,
            http_timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Same settings against another API base (used by tests and the CLI `--api` flag).
    pub fn with_api_base(mut self, base: &str) -> AppResult<Self> {
        self.api_base = parse_base(base)?;
        Ok(self)
    }

    /// Shared reqwest client: cookie store on so refresh cookies set at login are replayed.
    pub fn http_client(&self) -> AppResult<reqwest::Client> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.http_timeout)
            .build()?;
        Ok(client)
    }
}

/// Parse an API base and force a trailing slash so relative joins keep the path prefix.
pub fn parse_base(raw: &str) -> AppResult<Url> {
    let trimmed = raw.trim();
    let with_slash = if trimmed.ends_with('/') { trimmed.to_string() } else { format!("{trimmed}/") };
    Url::parse(&with_slash).map_err(|e| AppError::validation("invalid_api_base".to_string(), format!("{raw}: {e}")))
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!(target: "galley::config", "invalid {} value '{}': {}; using default {}", key, raw, e, default);
            default
        }),
        Err(_) => {
            debug!(target: "galley::config", "{} not set, using default: {}", key, default);
            default
        }
    }
}
