use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};

/// Which presence store backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown store backend {:?} (expected memory or sqlite)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreKind,
    pub db_path: PathBuf,
}

impl ServerConfig {
    /// Read `ONAIR_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let host = lookup("ONAIR_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("ONAIR_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("ONAIR_PORT must be a port number")?;
        let store: StoreKind = lookup("ONAIR_STORE")
            .unwrap_or_else(|| "sqlite".into())
            .parse()
            .context("invalid ONAIR_STORE")?;
        let db_path: PathBuf = lookup("ONAIR_DB_PATH")
            .unwrap_or_else(|| "onair.db".into())
            .into();

        Ok(Self {
            host,
            port,
            store,
            db_path,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
