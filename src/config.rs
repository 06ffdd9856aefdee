use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::limits::MAX_DAYS_AHEAD;
use crate::model::{Minute, Ms};
use crate::sync::SyncOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Knobs the engine consults on every read and claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Last bookable date is `today + max_days_ahead`.
    pub max_days_ahead: u32,
    /// How long a claim may stay unfinalized before the reaper releases it.
    pub claim_ttl_ms: Ms,
    /// Same-day slots must start at least this far from now.
    pub min_notice_minutes: Minute,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_days_ahead: 60,
            claim_ttl_ms: 15 * 60 * 1000,
            min_notice_minutes: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineConfig,
    pub sync: SyncOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let ttl_secs: i64 = parse_or(&get, "SLOTBOOK_CLAIM_TTL_SECS", 900)?;
        let claim_ttl_ms = ttl_secs
            .checked_mul(1000)
            .ok_or_else(|| ConfigError::Invalid {
                var: "SLOTBOOK_CLAIM_TTL_SECS",
                value: ttl_secs.to_string(),
            })?;
        let engine = EngineConfig {
            max_days_ahead: parse_or(&get, "SLOTBOOK_MAX_DAYS_AHEAD", 60)?,
            claim_ttl_ms,
            min_notice_minutes: parse_or(&get, "SLOTBOOK_MIN_NOTICE_MINUTES", 0)?,
        };
        if engine.max_days_ahead > MAX_DAYS_AHEAD {
            return Err(ConfigError::Inconsistent(
                "SLOTBOOK_MAX_DAYS_AHEAD exceeds 366",
            ));
        }
        if engine.claim_ttl_ms <= 0 {
            return Err(ConfigError::Inconsistent(
                "SLOTBOOK_CLAIM_TTL_SECS must be positive",
            ));
        }

        let poll_secs: u64 = parse_or(&get, "SLOTBOOK_POLL_INTERVAL_SECS", 5)?;
        if poll_secs == 0 {
            return Err(ConfigError::Inconsistent(
                "SLOTBOOK_POLL_INTERVAL_SECS must be positive",
            ));
        }
        let sync = SyncOptions {
            poll_interval: Duration::from_secs(poll_secs),
            ..SyncOptions::default()
        };

        let tls_cert = get("SLOTBOOK_TLS_CERT");
        let tls_key = get("SLOTBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::Inconsistent(
                "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither",
            ));
        }

        Ok(Self {
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "SLOTBOOK_PORT", 5433)?,
            data_dir: PathBuf::from(get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parse_or(&get, "SLOTBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port: get("SLOTBOOK_METRICS_PORT")
                .map(|v| parse_value("SLOTBOOK_METRICS_PORT", v))
                .transpose()?,
            tls_cert,
            tls_key,
            engine,
            sync,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        Some(value) => parse_value(var, value),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}
