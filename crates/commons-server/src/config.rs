use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use commons_api::messenger::DEFAULT_PAGE_LIMIT_MAX;
use commons_gateway::dispatcher::DEFAULT_CAPACITY;

/// Secrets that must never reach a running server.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub broadcast_capacity: usize,
    pub page_limit_max: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("COMMONS_JWT_SECRET").context("COMMONS_JWT_SECRET is not set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("COMMONS_JWT_SECRET is a placeholder; set a real secret");
        }

        let port = match lookup("COMMONS_PORT") {
            Some(port) => port.parse().context("COMMONS_PORT is not a valid port")?,
            None => 3000,
        };
        let broadcast_capacity = match lookup("COMMONS_BROADCAST_CAPACITY") {
            Some(n) => n.parse().context("COMMONS_BROADCAST_CAPACITY is not a number")?,
            None => DEFAULT_CAPACITY,
        };
        let page_limit_max = match lookup("COMMONS_PAGE_LIMIT_MAX") {
            Some(n) => n.parse().context("COMMONS_PAGE_LIMIT_MAX is not a number")?,
            None => DEFAULT_PAGE_LIMIT_MAX,
        };

        Ok(Self {
            host: lookup("COMMONS_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: PathBuf::from(lookup("COMMONS_DB_PATH").unwrap_or_else(|| "commons.db".into())),
            jwt_secret,
            broadcast_capacity,
            page_limit_max,
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = config(&[("COMMONS_JWT_SECRET", "s3cr3t-for-tests")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("commons.db"));
        assert_eq!(config.broadcast_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.page_limit_max, DEFAULT_PAGE_LIMIT_MAX);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn secret_is_required_and_not_a_placeholder() {
        assert!(config(&[]).is_err());
        assert!(config(&[("COMMONS_JWT_SECRET", "dev-secret-change-me")]).is_err());
        assert!(config(&[("COMMONS_JWT_SECRET", "  ")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("COMMONS_JWT_SECRET", "s3cr3t-for-tests"),
            ("COMMONS_HOST", "127.0.0.1"),
            ("COMMONS_PORT", "8081"),
            ("COMMONS_PAGE_LIMIT_MAX", "50"),
        ])
        .unwrap();
        assert_eq!(config.addr().unwrap().to_string(), "127.0.0.1:8081");
        assert_eq!(config.page_limit_max, 50);

        assert!(super::Config::from_lookup(|k| match k {
            "COMMONS_JWT_SECRET" => Some("s3cr3t-for-tests".into()),
            "COMMONS_PORT" => Some("not-a-port".into()),
            _ => None,
        })
        .is_err());
    }
}
