use std::env;

use burrow_net::NetworkConfig;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub jwt_expire_hours: i64,
    pub network: NetworkConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("environment variable {0} has an invalid value: {1:?}")]
    InvalidEnvVar(&'static str, String),
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidEnvVar(var, value)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            jwt_secret: require_env("JWT_SECRET")?,
            jwt_expire_hours: parse_env("JWT_EXPIRE_HOURS", 24)?,
            network: NetworkConfig {
                config_dir: env::var("WG_CONFIG_DIR")
                    .unwrap_or_else(|_| "/etc/burrow/wireguard".to_string())
                    .into(),
                base_subnet: env::var("WG_BASE_SUBNET").unwrap_or_else(|_| "10.200".to_string()),
                base_port: parse_env("WG_BASE_PORT", 51820)?,
                out_interface: require_env("WG_OUT_INTERFACE")?,
                server_ip: require_env("WG_SERVER_IP")?,
            },
        })
    }
}
