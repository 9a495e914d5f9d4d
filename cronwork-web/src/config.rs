//! Server configuration: defaults, optional TOML file, environment overrides.

use serde::{Deserialize, Serialize};

/// Environment variable names honored by [`ServerConfig::apply_env`].
pub const ENV_DATABASE_URL: &str = "DB_CONNECTION_STRING";
pub const ENV_PORT: &str = "PORT";
pub const ENV_ENVIRONMENT: &str = "NODE_ENV";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_TIMEZONE: &str = "TIMEZONE";
pub const ENV_ALLOWED_ORIGINS: &str = "ALLOWED_ORIGINS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: String,

    /// TCP port for the control plane.
    pub port: u16,

    /// PostgreSQL connection string. Required; boot fails without it.
    pub database_url: String,

    /// Connection pool size.
    pub pool_size: u32,

    /// Deployment environment; anything but `production` leaks error detail.
    pub environment: String,

    /// Reserved for the identity layer; read but unused by the core.
    pub jwt_secret: Option<String>,

    /// Informational only. Cron evaluation is fixed to IST regardless.
    pub timezone: String,

    /// CORS allowlist; empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            database_url: String::new(),
            pool_size: 20,
            environment: "development".to_string(),
            jwt_secret: None,
            timezone: cronwork::cron::TIMEZONE.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            self.database_url = url;
        }
        if let Some(port) = std::env::var(ENV_PORT).ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Ok(environment) = std::env::var(ENV_ENVIRONMENT) {
            self.environment = environment;
        }
        if let Ok(secret) = std::env::var(ENV_JWT_SECRET) {
            self.jwt_secret = Some(secret);
        }
        if let Ok(timezone) = std::env::var(ENV_TIMEZONE) {
            self.timezone = timezone;
        }
        if let Ok(origins) = std::env::var(ENV_ALLOWED_ORIGINS) {
            self.allowed_origins = origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect();
        }
        self
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.timezone, "Asia/Kolkata");
        assert!(!config.is_production());
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str("port = 8080").unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.environment, "development");
    }

    #[test]
    fn production_flag() {
        let mut config = ServerConfig::default();
        config.environment = "production".to_string();
        assert!(config.is_production());
    }
}
