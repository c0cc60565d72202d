use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use thiserror::Error;

use crate::model::Ms;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Settings the engine itself needs; everything else is server plumbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pending holds older than this are swept to cancelled.
    pub hold_ttl_ms: Ms,
    /// Upper bound on waiting for a resource lock or for room in the WAL queue.
    pub write_timeout: Duration,
    /// Offset used for peak-hour buckets and day-slot dates.
    pub report_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 15 * 60 * 1000,
            write_timeout: Duration::from_secs(5),
            report_offset: FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("static offset"),
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
    pub reaper_interval: Duration,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parsed = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            lookup(var)
                .map(|v| v.parse().map_err(|_| ConfigError::Invalid { var, value: v }))
                .transpose()
        };

        let port: u16 = match lookup("SLOTBOOK_PORT") {
            Some(v) => v.parse().map_err(|_| ConfigError::Invalid { var: "SLOTBOOK_PORT", value: v })?,
            None => 5433,
        };
        let metrics_port: Option<u16> = match lookup("SLOTBOOK_METRICS_PORT") {
            Some(v) => Some(v.parse().map_err(|_| ConfigError::Invalid {
                var: "SLOTBOOK_METRICS_PORT",
                value: v,
            })?),
            None => None,
        };
        let report_offset = match lookup("SLOTBOOK_REPORT_UTC_OFFSET") {
            Some(v) => parse_utc_offset(&v).ok_or(ConfigError::Invalid {
                var: "SLOTBOOK_REPORT_UTC_OFFSET",
                value: v,
            })?,
            None => EngineConfig::default().report_offset,
        };

        let defaults = EngineConfig::default();
        let hold_ttl_ms = match parsed("SLOTBOOK_HOLD_TTL_SECS")? {
            Some(secs) => Ms::try_from(secs)
                .ok()
                .and_then(|s| s.checked_mul(1000))
                .ok_or(ConfigError::Invalid {
                    var: "SLOTBOOK_HOLD_TTL_SECS",
                    value: secs.to_string(),
                })?,
            None => defaults.hold_ttl_ms,
        };
        let write_timeout = parsed("SLOTBOOK_WRITE_TIMEOUT_MS")?
            .map_or(defaults.write_timeout, Duration::from_millis);

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            data_dir: PathBuf::from(lookup("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parsed("SLOTBOOK_MAX_CONNECTIONS")?.map_or(256, |n| n as usize),
            compact_threshold: parsed("SLOTBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            reaper_interval: Duration::from_secs(parsed("SLOTBOOK_REAPER_INTERVAL_SECS")?.unwrap_or(5)),
            metrics_port,
            engine: EngineConfig {
                hold_ttl_ms,
                write_timeout,
                report_offset,
            },
        })
    }
}

/// Parse `+05:30`, `-0800`, `Z` or `UTC`.
pub fn parse_utc_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
