use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::DbParams;

const ENV_PREFIX: &str = "CAPACITY_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("{0} is required")]
    Missing(String),
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub capacity_db: DbParams,
    pub lifecycle_db: Option<DbParams>,
    pub snapshot_dir: PathBuf,
    pub hardware_map: Option<PathBuf>,
    pub decommission_after_days: u32,
    pub log_dir: String,
    /// Sealed password per database user.
    pub credentials: HashMap<String, String>,
}

#[derive(Deserialize, Default, Debug, Clone)]
struct PartialDbParams {
    host: Option<String>,
    port: Option<u16>,
    database: Option<String>,
    user: Option<String>,
}

impl PartialDbParams {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.database.is_none() && self.user.is_none()
    }

    /// Environment values win over file values.
    fn overlay(env: PartialDbParams, file: Option<PartialDbParams>) -> PartialDbParams {
        let file = file.unwrap_or_default();
        PartialDbParams {
            host: env.host.or(file.host),
            port: env.port.or(file.port),
            database: env.database.or(file.database),
            user: env.user.or(file.user),
        }
    }

    fn complete(self, section: &str) -> Result<DbParams, ConfigError> {
        let missing = |key: &str| ConfigError::Missing(format!("{section}.{key}"));
        Ok(DbParams {
            host: self.host.ok_or_else(|| missing("host"))?,
            port: self.port.unwrap_or(5432),
            database: self.database.ok_or_else(|| missing("database"))?,
            user: self.user.ok_or_else(|| missing("user"))?,
        })
    }
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct FileConfig {
    capacity_db: Option<PartialDbParams>,
    lifecycle_db: Option<PartialDbParams>,
    snapshot_dir: Option<PathBuf>,
    hardware_map: Option<PathBuf>,
    decommission_after_days: Option<u32>,
    log_dir: Option<String>,
    #[serde(default)]
    credentials: HashMap<String, String>,
}

/// `CAPACITY_*` environment overrides; database sections are flattened.
#[derive(Deserialize, Default, Debug)]
struct EnvConfig {
    db_host: Option<String>,
    db_port: Option<u16>,
    db_name: Option<String>,
    db_user: Option<String>,
    lifecycle_db_host: Option<String>,
    lifecycle_db_port: Option<u16>,
    lifecycle_db_name: Option<String>,
    lifecycle_db_user: Option<String>,
    snapshot_dir: Option<PathBuf>,
    hardware_map: Option<PathBuf>,
    decommission_after_days: Option<u32>,
    log_dir: Option<String>,
}

fn default_decommission_after_days() -> u32 {
    3
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl CollectorConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: FileConfig = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => FileConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: EnvConfig = envy::prefixed(ENV_PREFIX).from_env()?;

        // 3. Merge: environment overrides file
        Self::merge(file_config, env_config)
    }

    fn merge(file: FileConfig, env: EnvConfig) -> Result<Self, ConfigError> {
        let capacity_db = PartialDbParams::overlay(
            PartialDbParams {
                host: env.db_host,
                port: env.db_port,
                database: env.db_name,
                user: env.db_user,
            },
            file.capacity_db,
        )
        .complete("capacity_db")?;

        let lifecycle = PartialDbParams::overlay(
            PartialDbParams {
                host: env.lifecycle_db_host,
                port: env.lifecycle_db_port,
                database: env.lifecycle_db_name,
                user: env.lifecycle_db_user,
            },
            file.lifecycle_db,
        );
        let lifecycle_db = if lifecycle.is_empty() {
            None
        } else {
            Some(lifecycle.complete("lifecycle_db")?)
        };

        Ok(CollectorConfig {
            capacity_db,
            lifecycle_db,
            snapshot_dir: env
                .snapshot_dir
                .or(file.snapshot_dir)
                .ok_or_else(|| ConfigError::Missing("snapshot_dir".to_string()))?,
            hardware_map: env.hardware_map.or(file.hardware_map),
            decommission_after_days: env
                .decommission_after_days
                .or(file.decommission_after_days)
                .unwrap_or_else(default_decommission_after_days),
            log_dir: env
                .log_dir
                .or(file.log_dir)
                .unwrap_or_else(default_log_dir),
            credentials: file.credentials,
        })
    }
}
