//! Manager configuration
//!
//! Every field has a default so a YAML file only needs to name the database:
//!
//! ```yaml
//! database: telemetry
//! host: influx.internal
//! retention_policy: one_year
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{BackupError, Result};

/// Backup manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Host where InfluxDB is running
    pub host: String,
    /// InfluxDB HTTP API port
    pub port: u16,
    /// Database to back up and restore into
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Root folder for scratch directories
    pub tmp_folder: PathBuf,
    /// Suffix appended to the database name for the temporary restore target
    pub suffix: String,
    /// Retention policy copied during sideload
    pub retention_policy: String,
    /// InfluxDB backup/restore RPC port
    pub backup_port: u16,
    /// Path or name of the influxd binary
    pub binary: PathBuf,
    /// Timeout of the liveness probe issued by `init`
    pub ping_timeout_ms: u64,
    /// Pause before the sideload query so the engine can settle after a restore
    pub settle_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let tmp_folder = std::env::current_dir()
            .map(|dir| dir.join(".tmp"))
            .unwrap_or_else(|_| PathBuf::from(".tmp"));

        Self {
            host: "localhost".to_string(),
            port: 8086,
            database: String::new(),
            username: None,
            password: None,
            tmp_folder,
            suffix: "_bak".to_string(),
            retention_policy: "autogen".to_string(),
            backup_port: 8088,
            binary: PathBuf::from("influxd"),
            ping_timeout_ms: 5_000,
            settle_delay_ms: 2_000,
        }
    }
}

impl ManagerConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    /// Read a YAML file without validating it, so callers can layer
    /// overrides on top before calling [`ManagerConfig::validate`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Load and validate a configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(BackupError::Config("database name is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(BackupError::Config("host must not be empty".into()));
        }
        if self.suffix.is_empty() {
            return Err(BackupError::Config("backup suffix must not be empty".into()));
        }
        if self.retention_policy.trim().is_empty() {
            return Err(BackupError::Config(
                "retention policy must not be empty".into(),
            ));
        }
        if self.binary.as_os_str().is_empty() {
            return Err(BackupError::Config("influxd binary must not be empty".into()));
        }
        if self.port == 0 || self.backup_port == 0 {
            return Err(BackupError::Config("ports must be non-zero".into()));
        }
        Ok(())
    }

    /// Name of the temporary database a restore writes into
    pub fn backup_database(&self) -> String {
        format!("{}{}", self.database, self.suffix)
    }

    /// `host:port` of the backup RPC endpoint passed to influxd
    pub fn backup_address(&self) -> String {
        format!("{}:{}", self.host, self.backup_port)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
