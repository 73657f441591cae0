use std::env;
use std::fs;
use std::path::PathBuf;

use config::{Config, ConfigError as BaseConfigError, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{self, AccessGate};
use crate::codes::MAX_CODE_LENGTH;
use crate::store::StoreOptions;
use crate::ttl;

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub max_payload_bytes: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct CodesConfig {
    /// Length of every code; the keyspace is 36^length.
    pub length: usize,
    /// Ceiling for the per-entry download counter.
    pub max_downloads: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ExpiryConfig {
    /// Lifetime used when an upload does not request one, e.g. "3 days".
    pub default_ttl: String,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SecurityConfig {
    pub argon2_memory_kib: u32,
    pub argon2_time_cost: u32,
    pub argon2_parallelism: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub codes: CodesConfig,
    pub expiry: ExpiryConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] BaseConfigError),
    #[error("Storage directory error: {0}")]
    StorageDir(String),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut settings = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(File::with_name("config").required(false));

        // Environment variables win over file values when present
        if let Ok(value) = env::var("SERVER_BIND_ADDR") {
            settings = settings.set_override("server.bind_addr", value)?;
        }
        if let Ok(value) = env::var("SERVER_PORT") {
            settings =
                settings.set_override("server.port", parse_env::<u16>("SERVER_PORT", &value)?)?;
        }
        if let Ok(value) = env::var("DATABASE_URL") {
            settings = settings.set_override("database.url", value)?;
        }
        if let Ok(value) = env::var("STORAGE_ROOT") {
            settings = settings.set_override("storage.root", value)?;
        }
        if let Ok(value) = env::var("MAX_PAYLOAD_BYTES") {
            settings = settings.set_override(
                "storage.max_payload_bytes",
                parse_env::<u64>("MAX_PAYLOAD_BYTES", &value)?,
            )?;
        }
        if let Ok(value) = env::var("CODE_LENGTH") {
            settings =
                settings.set_override("codes.length", parse_env::<u64>("CODE_LENGTH", &value)?)?;
        }
        if let Ok(value) = env::var("MAX_DOWNLOADS") {
            settings = settings.set_override(
                "codes.max_downloads",
                parse_env::<u32>("MAX_DOWNLOADS", &value)?,
            )?;
        }
        if let Ok(value) = env::var("DEFAULT_TTL") {
            settings = settings.set_override("expiry.default_ttl", value)?;
        }
        if let Ok(value) = env::var("ARGON2_MEMORY_KIB") {
            settings = settings.set_override(
                "security.argon2_memory_kib",
                parse_env::<u32>("ARGON2_MEMORY_KIB", &value)?,
            )?;
        }
        if let Ok(value) = env::var("ARGON2_TIME_COST") {
            settings = settings.set_override(
                "security.argon2_time_cost",
                parse_env::<u32>("ARGON2_TIME_COST", &value)?,
            )?;
        }
        if let Ok(value) = env::var("ARGON2_PARALLELISM") {
            settings = settings.set_override(
                "security.argon2_parallelism",
                parse_env::<u32>("ARGON2_PARALLELISM", &value)?,
            )?;
        }

        let settings = settings.build()?;
        let config: AppConfig = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.codes.length < 1 || self.codes.length > MAX_CODE_LENGTH {
            return Err(ConfigError::Validation(format!(
                "CODE_LENGTH must be between 1 and {MAX_CODE_LENGTH}"
            )));
        }
        if self.codes.max_downloads < 1 {
            return Err(ConfigError::Validation(
                "MAX_DOWNLOADS must be at least 1".to_string(),
            ));
        }

        if self.storage.max_payload_bytes < 1024 {
            return Err(ConfigError::Validation(
                "MAX_PAYLOAD_BYTES must be at least 1KB".to_string(),
            ));
        }
        if self.storage.max_payload_bytes > 1024 * 1024 * 1024 {
            return Err(ConfigError::Validation(
                "MAX_PAYLOAD_BYTES cannot exceed 1GB".to_string(),
            ));
        }

        // Ensure the storage directory exists or can be created
        if let Err(e) = fs::create_dir_all(&self.storage.root) {
            return Err(ConfigError::StorageDir(format!(
                "Cannot create storage directory {}: {}",
                self.storage.root.display(),
                e
            )));
        }

        if ttl::parse_ttl(&self.expiry.default_ttl).is_err() {
            return Err(ConfigError::Validation(format!(
                "DEFAULT_TTL is not a valid duration: {:?}",
                self.expiry.default_ttl
            )));
        }

        if self.security.argon2_time_cost < 1 || self.security.argon2_parallelism < 1 {
            return Err(ConfigError::Validation(
                "Argon2 time cost and parallelism must be at least 1".to_string(),
            ));
        }
        if self.security.argon2_memory_kib < 8 * self.security.argon2_parallelism {
            return Err(ConfigError::Validation(
                "ARGON2_MEMORY_KIB must be at least 8 KiB per lane".to_string(),
            ));
        }

        Ok(())
    }

    /// Assemble the store's knobs from the loaded configuration.
    pub fn store_options(&self) -> StoreOptions {
        let mut options = StoreOptions::new(self.storage.root.clone());
        options.code_length = self.codes.length;
        options.max_downloads = self.codes.max_downloads;
        options.default_ttl = self.expiry.default_ttl.clone();
        options.gate = AccessGate::new(
            self.security.argon2_memory_kib,
            self.security.argon2_time_cost,
            self.security.argon2_parallelism,
        );
        options
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse::<T>()
        .map_err(|_| ConfigError::Validation(format!("{name} is not valid: {value:?}")))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1".to_string(),
                port: 8888,
            },
            database: DatabaseConfig {
                url: "sqlite://./data/codedrop.db?mode=rwc".to_string(),
            },
            storage: StorageConfig {
                root: PathBuf::from("./data/files"),
                max_payload_bytes: 100 * 1024 * 1024, // 100MB
            },
            codes: CodesConfig {
                length: 3,
                max_downloads: 3,
            },
            expiry: ExpiryConfig {
                default_ttl: ttl::DEFAULT_TTL.to_string(),
            },
            security: SecurityConfig {
                argon2_memory_kib: access::DEFAULT_MEMORY_COST_KIB,
                argon2_time_cost: access::DEFAULT_TIME_COST,
                argon2_parallelism: access::DEFAULT_PARALLELISM,
            },
        }
    }
}
