//! Configuration management for pii-ingest

use crate::hasher::Salt;
use crate::schema::EXPECTED_COLUMNS;
use crate::store::validate_identifier;
use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub pseudonymization: PseudonymizationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub input_dir: PathBuf,
    pub tenants: Vec<String>,
    #[serde(default = "default_max_concurrent_tenants")]
    pub max_concurrent_tenants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PseudonymizationConfig {
    /// Usually supplied through the environment rather than the file
    pub salt: Option<String>,
    #[serde(default = "default_pii_column")]
    pub pii_column: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_busy_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_tenants() -> usize {
    4
}

fn default_pii_column() -> String {
    "user_id".to_string()
}

fn default_batch_size() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                database_path: PathBuf::from("sqlite.db"),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            ingest: IngestConfig {
                input_dir: PathBuf::from("raw_data"),
                tenants: (1..=5).map(|i| format!("tenant{}", i)).collect(),
                max_concurrent_tenants: default_max_concurrent_tenants(),
            },
            pseudonymization: PseudonymizationConfig {
                salt: None,
                pii_column: default_pii_column(),
                batch_size: default_batch_size(),
            },
        }
    }
}

impl Config {
    pub fn get_app_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("com", "pii-ingest", "pii-ingest")
            .ok_or_else(|| anyhow::anyhow!("Failed to determine application directories"))
    }

    pub fn resolve_paths(&mut self) -> Result<()> {
        let project_dirs = Self::get_app_dirs()?;
        let data_dir = project_dirs.data_dir();

        if self.storage.database_path.is_relative()
            && self.storage.database_path != Path::new(":memory:")
        {
            std::fs::create_dir_all(data_dir)?;
            self.storage.database_path = data_dir.join(&self.storage.database_path);
        }

        if self.ingest.input_dir.is_relative() {
            self.ingest.input_dir = data_dir.join(&self.ingest.input_dir);
        }

        Ok(())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        config.resolve_paths()?;
        Ok(config)
    }

    pub fn get_default_config_path() -> Result<PathBuf> {
        let project_dirs = Self::get_app_dirs()?;
        let config_dir = project_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;
        Ok(config_dir.join("pii-ingest.toml"))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// The configured salt. Missing or empty salts are an error rather than a
    /// silent default.
    pub fn salt(&self) -> Result<Salt> {
        let value = self.pseudonymization.salt.clone().ok_or_else(|| {
            anyhow::anyhow!("No salt configured: set pseudonymization.salt or PII_INGEST_SALT")
        })?;
        Ok(Salt::new(value)?)
    }

    pub fn validate(&self) -> Result<()> {
        for tenant in &self.ingest.tenants {
            validate_identifier(tenant)
                .map_err(|e| anyhow::anyhow!("Invalid tenant '{}': {}", tenant, e))?;
        }

        if self.pseudonymization.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be greater than zero"));
        }

        if self.ingest.max_concurrent_tenants == 0 {
            return Err(anyhow::anyhow!("max_concurrent_tenants must be greater than zero"));
        }

        let pii_column = self.pseudonymization.pii_column.as_str();
        if !EXPECTED_COLUMNS.contains(&pii_column) || matches!(pii_column, "id" | "value") {
            return Err(anyhow::anyhow!(
                "PII column '{}' must be one of the text columns: user_id, event_time, country",
                pii_column
            ));
        }

        if let Some(salt) = &self.pseudonymization.salt {
            Salt::new(salt.clone())?;
        }

        if let Some(parent) = self.storage.database_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Ok(())
    }
}
