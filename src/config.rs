use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::limits::{DEFAULT_OTP_CAPACITY, DEFAULT_OTP_TTL_MS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RENTD_ADMINS: `{0}` is not a valid user id")]
    BadAdmin(String),
    #[error("both RENTD_TLS_CERT and RENTD_TLS_KEY must be set, or neither")]
    HalfTls,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub admins: HashSet<Ulid>,
    pub otp_ttl: Duration,
    pub otp_capacity: usize,
    pub otp_sweep_every: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests need not touch
    /// the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let number = |key: &str, default| parsed(lookup(key), default);

        let tls_cert = lookup("RENTD_TLS_CERT").filter(|s| !s.is_empty());
        let tls_key = lookup("RENTD_TLS_KEY").filter(|s| !s.is_empty());
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::HalfTls);
        }

        Ok(Self {
            port: parsed(lookup("RENTD_PORT"), 5433),
            bind: lookup("RENTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("RENTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("RENTD_PASSWORD").unwrap_or_else(|| "rentd".into()),
            max_connections: parsed(lookup("RENTD_MAX_CONNECTIONS"), 256),
            compact_threshold: parsed(lookup("RENTD_COMPACT_THRESHOLD"), 1000),
            metrics_port: lookup("RENTD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert,
            tls_key,
            admins: parse_admins(lookup("RENTD_ADMINS").as_deref().unwrap_or(""))?,
            otp_ttl: Duration::from_secs(number("RENTD_OTP_TTL_SECS", DEFAULT_OTP_TTL_MS as u64 / 1000)),
            otp_capacity: parsed(lookup("RENTD_OTP_CAPACITY"), DEFAULT_OTP_CAPACITY),
            otp_sweep_every: Duration::from_secs(number("RENTD_OTP_SWEEP_SECS", 30).max(1)),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rentd.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_admins(raw: &str) -> Result<HashSet<Ulid>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|_| ConfigError::BadAdmin(s.to_string())))
        .collect()
}
