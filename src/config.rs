use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

/// Runtime settings, read once from `ROOMD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub accounts: Option<PathBuf>,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// Zone for statistics and for rooms registered without one.
    pub timezone: Tz,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(get("ROOMD_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let upload_dir = get("ROOMD_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("uploads"));

        let max_connections: usize = parse(&get, "ROOMD_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOMD_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            bind: get("ROOMD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "ROOMD_PORT")?.unwrap_or(5433),
            data_dir,
            upload_dir,
            accounts: get("ROOMD_ACCOUNTS").map(PathBuf::from),
            admin_password: get("ROOMD_ADMIN_PASSWORD").unwrap_or_else(|| "roomd".into()),
            max_connections,
            compact_threshold: parse(&get, "ROOMD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            timezone: parse(&get, "ROOMD_TIMEZONE")?.unwrap_or(chrono_tz::Asia::Jakarta),
            tls_cert: get("ROOMD_TLS_CERT"),
            tls_key: get("ROOMD_TLS_KEY"),
            metrics_port: parse(&get, "ROOMD_METRICS_PORT")?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomd.wal")
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}
