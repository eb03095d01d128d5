use crate::identity::Pepper;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

const DEFAULT_DATABASE_URL: &str = "sqlite:ballot_ledger.db";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_RESET_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set to a non-empty value")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Process-wide settings, read once at startup.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub max_connections: u32,
    pub reset_page_size: u32,
    pub pepper: Pepper,
    pub admin_key: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("reset_page_size", &self.reset_page_size)
            .field("pepper", &self.pepper)
            .field("admin_key", &"<redacted>")
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source so tests don't touch the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pepper = lookup("VOTER_PEPPER")
            .and_then(Pepper::new)
            .ok_or(ConfigError::Missing("VOTER_PEPPER"))?;

        let admin_key = lookup("ADMIN_KEY")
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::Missing("ADMIN_KEY"))?;

        let database_url = lookup("DATABASE_URL")
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let bind_addr = parse_or(&lookup, "BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?;
        let max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", Some(DEFAULT_MAX_CONNECTIONS))?;
        let reset_page_size = parse_or(&lookup, "RESET_PAGE_SIZE", Some(DEFAULT_RESET_PAGE_SIZE))?;

        if max_connections == 0 {
            return Err(ConfigError::Invalid { name: "DB_MAX_CONNECTIONS", value: "0".to_string() });
        }
        if reset_page_size == 0 {
            return Err(ConfigError::Invalid { name: "RESET_PAGE_SIZE", value: "0".to_string() });
        }

        Ok(Self {
            database_url,
            bind_addr,
            max_connections,
            reset_page_size,
            pepper,
            admin_key,
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: Option<T>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => default.ok_or(ConfigError::Missing(name)),
    }
}
