use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("MURMUR_JWT_SECRET is still a placeholder")]
    PlaceholderSecret,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_ttl: chrono::Duration,
    pub refresh_ttl: chrono::Duration,
    pub history_max_limit: u32,
    pub store_timeout: Duration,
    /// Register and login requests allowed per client within `auth_rate_window`.
    pub auth_rate_limit: usize,
    pub auth_rate_window: Duration,
    /// Failed logins allowed per username within `login_failure_window`.
    pub login_max_failures: usize,
    pub login_failure_window: Duration,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("MURMUR_JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("MURMUR_JWT_SECRET"))?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let access_minutes: i64 = parse_or(&lookup, "MURMUR_ACCESS_TTL_MINUTES", 15)?;
        let refresh_days: i64 = parse_or(&lookup, "MURMUR_REFRESH_TTL_DAYS", 14)?;
        let store_timeout_secs: u64 = parse_or(&lookup, "MURMUR_STORE_TIMEOUT_SECS", 5)?;
        let auth_rate_window_secs: u64 = parse_or(&lookup, "MURMUR_AUTH_RATE_WINDOW_SECS", 10)?;
        let login_failure_window_secs: u64 = parse_or(&lookup, "MURMUR_LOGIN_FAILURE_WINDOW_SECS", 900)?;
        let cleanup_interval_secs: u64 = parse_or(&lookup, "MURMUR_CLEANUP_INTERVAL_SECS", 3600)?;
        if cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "MURMUR_CLEANUP_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        Ok(Self {
            host: lookup("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "MURMUR_PORT", 3000)?,
            db_path: lookup("MURMUR_DB_PATH")
                .unwrap_or_else(|| "murmur.db".into())
                .into(),
            jwt_secret,
            jwt_issuer: lookup("MURMUR_JWT_ISSUER").unwrap_or_else(|| "murmur".into()),
            access_ttl: chrono::Duration::minutes(access_minutes),
            refresh_ttl: chrono::Duration::days(refresh_days),
            history_max_limit: parse_or(&lookup, "MURMUR_HISTORY_MAX_LIMIT", 200)?,
            store_timeout: Duration::from_secs(store_timeout_secs),
            auth_rate_limit: parse_or(&lookup, "MURMUR_AUTH_RATE_LIMIT", 50)?,
            auth_rate_window: Duration::from_secs(auth_rate_window_secs),
            login_max_failures: parse_or(&lookup, "MURMUR_LOGIN_MAX_FAILURES", 5)?,
            login_failure_window: Duration::from_secs(login_failure_window_secs),
            cleanup_interval: Duration::from_secs(cleanup_interval_secs),
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
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}
