use std::{
    env,
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;
use url::Url;

use crate::pdp::engine_config::EngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unknown identity backend '{0}', expected keycloak, dynamodb or memory")]
    UnknownIdentityBackend(String),
}

pub(crate) fn env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

pub(crate) fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key).ok().filter(|value| !value.trim().is_empty()) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(default),
    }
}

#[derive(Clone, Debug)]
pub struct KeycloakConfig {
    pub url: Url,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    /// Keycloak < 17 serves everything under `/auth`.
    pub legacy: bool,
    pub request_timeout: Duration,
}

impl KeycloakConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw_url = env_or("KEYCLOAK_URL", "http://localhost:8080");
        let url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidValue {
            key: "KEYCLOAK_URL".to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            url,
            realm: env_or("KEYCLOAK_REALM", "tdf"),
            client_id: env_or("KEYCLOAK_CLIENT_ID", "tdf-entity-resolution-service"),
            client_secret: env::var("KEYCLOAK_CLIENT_SECRET").unwrap_or_default(),
            legacy: env_flag("KEYCLOAK_LEGACY"),
            request_timeout: Duration::from_secs(parse_env("KEYCLOAK_REQUEST_TIMEOUT", 10)?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct DynamoDirectoryConfig {
    pub users_table: String,
    pub users_email_index: String,
    pub users_username_index: String,
    pub groups_table: String,
    pub groups_name_index: String,
}

impl DynamoDirectoryConfig {
    pub fn from_env() -> Self {
        Self {
            users_table: env_or("USERS_TABLE_NAME", "UsersTable"),
            users_email_index: env_or("USERS_TABLE_EMAIL_INDEX_NAME", "emailIndex"),
            users_username_index: env_or("USERS_TABLE_USERNAME_INDEX_NAME", "usernameIndex"),
            groups_table: env_or("GROUPS_TABLE_NAME", "GroupsTable"),
            groups_name_index: env_or("GROUPS_TABLE_NAME_INDEX_NAME", "nameIndex"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum IdentityBackend {
    Keycloak(KeycloakConfig),
    DynamoDb(DynamoDirectoryConfig),
    Memory { seed: Option<PathBuf> },
}

impl IdentityBackend {
    pub fn from_env() -> Result<Self, ConfigError> {
        match env_or("IDENTITY_BACKEND", "keycloak").as_str() {
            "keycloak" => Ok(Self::Keycloak(KeycloakConfig::from_env()?)),
            "dynamodb" => Ok(Self::DynamoDb(DynamoDirectoryConfig::from_env())),
            "memory" => Ok(Self::Memory {
                seed: env::var("MEMORY_DIRECTORY_SEED").ok().map(PathBuf::from),
            }),
            other => Err(ConfigError::UnknownIdentityBackend(other.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_json: bool,
    pub verbose: bool,
    pub engine: EngineConfig,
    pub identity: IdentityBackend,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let host: IpAddr = parse_env("SERVER_HOST", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port: u16 = parse_env("SERVER_PORT", 3355)?;

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            log_json: env_flag("SERVER_LOG_JSON"),
            verbose: env_flag("VERBOSE"),
            engine: EngineConfig::from_env()?,
            identity: IdentityBackend::from_env()?,
        })
    }
}
