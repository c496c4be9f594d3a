//! Environment configuration

use anyhow::{Context, Result};

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub database_url: String,

    /// Address of an external durable backend, when the event store should
    /// not live in the primary database.
    pub durable_backend_address: Option<String>,

    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub cors_origins: Vec<String>,
    pub log_level: String,

    /// Base64-encoded 32-byte key for credential encryption.
    pub encryption_key: Option<String>,
}

impl Config {
    /// Read configuration from the environment. `.env` files are honored in
    /// development; `DATABASE_URL` and `JWT_SECRET` are required.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
        let jwt_secret =
            std::env::var("JWT_SECRET").context("JWT_SECRET environment variable required")?;

        let listen_port = std::env::var("LISTEN_PORT")
            .unwrap_or_else(|_| "9000".to_string())
            .parse()
            .context("LISTEN_PORT must be a port number")?;

        let cors_origins = std::env::var("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            listen_host: std::env::var("LISTEN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            listen_port,
            database_url,
            durable_backend_address: std::env::var("DURABLE_BACKEND_ADDRESS").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            jwt_secret,
            cors_origins,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            encryption_key: std::env::var("SECRETS_ENCRYPTION_KEY").ok(),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr_format() {
        let config = Config {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            database_url: "postgres://localhost/flowmaestro".to_string(),
            durable_backend_address: None,
            redis_url: None,
            jwt_secret: "secret".to_string(),
            cors_origins: vec![],
            log_level: "info".to_string(),
            encryption_key: None,
        };
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
    }
}
