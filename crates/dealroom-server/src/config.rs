use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// Value shipped in `.env.example`; never valid for a running server.
pub const PLACEHOLDER_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = get("DEALROOM_JWT_SECRET").context("DEALROOM_JWT_SECRET is not set")?;
        if jwt_secret.trim().is_empty() || jwt_secret == PLACEHOLDER_SECRET {
            bail!("DEALROOM_JWT_SECRET must be set to a real secret");
        }

        let port = match get("DEALROOM_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("DEALROOM_PORT is not a port number: {}", raw))?,
            None => 3000,
        };

        Ok(Self {
            jwt_secret,
            db_path: get("DEALROOM_DB_PATH").unwrap_or_else(|| "dealroom.db".into()).into(),
            host: get("DEALROOM_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
