//! Backup manager: backup, restore and sideload workflows for one database
//!
//! All influxd invocations of a manager go through its [`ProcessQueue`], so
//! at most one backup or restore process runs per manager at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use semver::Version;
use tracing::{debug, error, info, instrument, warn};

use crate::archive;
use crate::client::{quote_identifier, HttpInfluxClient, InfluxClient};
use crate::config::ManagerConfig;
use crate::errors::{BackupError, Result};
use crate::process::{InfluxdRunner, ProcessRunner};
use crate::queue::ProcessQueue;
use crate::scratch::{self, ScratchDir};

/// Oldest InfluxDB release with portable backups
pub const MIN_INFLUX_VERSION: &str = "1.5.0";

/// Options for [`BackupManager::backup`]
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Only back up data written at or after this instant
    pub start: Option<DateTime<Utc>>,
    /// Only back up data written before this instant
    pub end: Option<DateTime<Utc>>,
    /// Archive name; `.zip` is appended when missing
    pub file_name: Option<String>,
}

/// A finished backup archive and the scratch directory holding it
#[derive(Debug)]
pub struct BackupArchive {
    path: PathBuf,
    scratch: ScratchDir,
}

impl BackupArchive {
    /// Absolute path of the zip file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Move the archive into `dest_dir` and remove the scratch directory
    pub async fn persist(self, dest_dir: &Path) -> Result<PathBuf> {
        scratch::create_directory(dest_dir).await?;
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| BackupError::Internal("archive path has no file name".into()))?;
        let dest = dest_dir.join(file_name);

        if tokio::fs::rename(&self.path, &dest).await.is_err() {
            // Different filesystem
            tokio::fs::copy(&self.path, &dest).await?;
        }
        self.scratch.release().await?;
        Ok(dest)
    }

    /// Discard the archive together with its scratch directory
    pub async fn release(self) -> Result<()> {
        self.scratch.release().await
    }
}

/// Render an instant the way influxd expects `-start`/`-end`
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 instant, a naive date-time (UTC) or a plain date
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(BackupError::InvalidDate(value.to_string()))
}

fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Archive name for a backup taken on `today`
pub fn archive_name(options: &BackupOptions, today: NaiveDate) -> String {
    if let Some(name) = options.file_name.as_deref().filter(|n| !n.is_empty()) {
        return if name.ends_with(".zip") {
            name.to_string()
        } else {
            format!("{}.zip", name)
        };
    }

    let mut name = String::from("backup");
    if let Some(start) = &options.start {
        name.push('_');
        name.push_str(&compact_date(start.date_naive()));
    }
    name.push('_');
    name.push_str(&compact_date(
        options.end.map(|end| end.date_naive()).unwrap_or(today),
    ));
    name.push_str(".zip");
    name
}

/// Parse a version string reported by InfluxDB (`1.8.10`, `v1.7`, `1.8.3-c1.8.3`)
pub fn parse_influx_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = core.split('.').filter(|p| !p.is_empty());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some(Version::new(major, minor, patch))
}

/// Reject InfluxDB releases older than [`MIN_INFLUX_VERSION`]
pub fn check_version(raw: &str) -> Result<Version> {
    let minimum = Version::parse(MIN_INFLUX_VERSION)
        .map_err(|e| BackupError::Internal(e.to_string()))?;
    match parse_influx_version(raw) {
        Some(version) if version >= minimum => Ok(version),
        _ => Err(BackupError::UnsupportedVersion {
            found: raw.to_string(),
            minimum: MIN_INFLUX_VERSION.to_string(),
        }),
    }
}

fn backup_args(config: &ManagerConfig, options: &BackupOptions) -> Vec<String> {
    let mut args = vec![
        "backup".to_string(),
        "-portable".to_string(),
        "-database".to_string(),
        config.database.clone(),
        "-host".to_string(),
        config.backup_address(),
    ];
    if let Some(start) = &options.start {
        args.push("-start".to_string());
        args.push(format_instant(start));
    }
    if let Some(end) = &options.end {
        args.push("-end".to_string());
        args.push(format_instant(end));
    }
    args.push("./".to_string());
    args
}

fn restore_args(config: &ManagerConfig) -> Vec<String> {
    vec![
        "restore".to_string(),
        "-portable".to_string(),
        "-db".to_string(),
        config.database.clone(),
        "-newdb".to_string(),
        config.backup_database(),
        "-host".to_string(),
        config.backup_address(),
        "./".to_string(),
    ]
}

fn sideload_query(config: &ManagerConfig) -> String {
    format!(
        "SELECT * INTO {}.{}.:MEASUREMENT FROM {}.{}./.*/ GROUP BY *",
        quote_identifier(&config.database),
        quote_identifier(&config.retention_policy),
        quote_identifier(&config.backup_database()),
        quote_identifier(&config.retention_policy),
    )
}

/// Backup manager for one InfluxDB database
pub struct BackupManager {
    config: ManagerConfig,
    client: Arc<dyn InfluxClient>,
    queue: ProcessQueue,
    initialized: AtomicBool,
}

impl BackupManager {
    /// Manager talking to InfluxDB over HTTP and running the configured influxd
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let client = Arc::new(HttpInfluxClient::new(&config)?);
        let runner = Arc::new(InfluxdRunner::new(config.binary.clone()));
        Self::with_parts(config, client, runner)
    }

    /// Manager with explicit client and process runner
    pub fn with_parts(
        config: ManagerConfig,
        client: Arc<dyn InfluxClient>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client,
            queue: ProcessQueue::new(runner),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn queue(&self) -> &ProcessQueue {
        &self.queue
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(BackupError::Uninitialized)
        }
    }

    /// Check that InfluxDB is reachable and recent enough, then create the temp folder
    #[instrument(skip(self), fields(host = %self.config.host, port = self.config.port))]
    pub async fn init(&self) -> Result<()> {
        if let Err(e) = self.check_database().await {
            error!("Error while init: {}", e);
            return Err(e);
        }

        scratch::create_directory(&self.config.tmp_folder).await?;
        self.initialized.store(true, Ordering::Release);
        info!("Backup manager ready (tmp folder {:?})", self.config.tmp_folder);
        Ok(())
    }

    async fn check_database(&self) -> Result<()> {
        let hosts = self.client.ping(self.config.ping_timeout()).await?;
        let local = hosts
            .iter()
            .find(|h| h.host == self.config.host && h.port == self.config.port);

        let version = match local {
            Some(status) if status.online => status.version.as_deref(),
            _ => None,
        };
        let version = version.ok_or_else(|| BackupError::Unreachable {
            host: self.config.host.clone(),
            port: self.config.port,
        })?;

        let version = check_version(version)?;
        info!("InfluxDB version: {}", version);
        Ok(())
    }

    /// Create an empty scratch directory under the temp folder
    pub async fn create_dir(&self) -> Result<PathBuf> {
        self.ensure_initialized()?;
        let dir = ScratchDir::create(&self.config.tmp_folder).await?;
        Ok(dir.into_path())
    }

    /// Delete a directory and everything in it
    pub async fn delete_dir(&self, path: &Path) -> Result<()> {
        self.ensure_initialized()?;
        scratch::remove_directory(path).await
    }

    /// Run influxd backup and zip its output
    #[instrument(skip(self))]
    pub async fn backup(&self, options: BackupOptions) -> Result<BackupArchive> {
        self.ensure_initialized()?;

        let scratch = ScratchDir::create(&self.config.tmp_folder).await?;
        match self.backup_into(&scratch, &options).await {
            Ok(path) => {
                info!("Influx backup created and zipped at {:?}", path);
                Ok(BackupArchive { path, scratch })
            }
            Err(e) => {
                error!("Backup failed: {}", e);
                if let Err(cleanup) = scratch.release().await {
                    warn!("Failed to remove backup directory: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn backup_into(&self, scratch: &ScratchDir, options: &BackupOptions) -> Result<PathBuf> {
        let args = backup_args(&self.config, options);
        self.queue.run(scratch.path(), args).await?;

        let name = archive_name(options, Utc::now().date_naive());
        let dest = std::path::absolute(scratch.path().join(name))?;
        archive::write_archive(scratch.path(), &dest).await
    }

    /// Restore an uploaded archive into the suffixed temporary database.
    ///
    /// `restore_path` is removed afterwards whatever the outcome.
    #[instrument(skip(self))]
    pub async fn restore(&self, restore_path: &Path, file_name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let result = self.restore_from(restore_path, file_name).await;
        match &result {
            Ok(()) => info!("Backup restored into {}", self.config.backup_database()),
            Err(e) => error!("Restore failed: {}", e),
        }

        debug!("Clean up backup files in {:?}", restore_path);
        if let Err(e) = scratch::remove_directory(restore_path).await {
            warn!("Failed to remove restore directory {:?}: {}", restore_path, e);
        }
        result
    }

    async fn restore_from(&self, restore_path: &Path, file_name: &str) -> Result<()> {
        self.drop_database(&self.config.backup_database()).await?;

        let files = archive::extract_archive(&restore_path.join(file_name), restore_path).await?;
        debug!("Extracted {} backup files", files.len());

        self.queue.run(restore_path, restore_args(&self.config)).await
    }

    /// Copy everything from the suffixed temporary database into the main one
    #[instrument(skip(self))]
    pub async fn load_backup(&self) -> Result<()> {
        self.ensure_initialized()?;

        let query = sideload_query(&self.config);
        info!("Sideload DB into main DB: {}", query);

        // Queries right after a restore can hit "shard disabled" or "engine is closed"
        tokio::time::sleep(self.config.settle_delay()).await;

        let result = self.client.query(&query).await.map(|_| ());
        if let Err(e) = &result {
            error!("Sideload failed: {}", e);
        }

        let backup_db = self.config.backup_database();
        if let Err(e) = self.drop_database(&backup_db).await {
            warn!("Failed to drop {} after sideload: {}", backup_db, e);
        }
        result
    }

    /// Drop a database if it exists
    #[instrument(skip(self))]
    pub async fn drop_database(&self, name: &str) -> Result<()> {
        self.ensure_initialized()?;

        let names = self.client.database_names().await?;
        if !names.iter().any(|n| n == name) {
            debug!("Database {} does not exist, nothing to drop", name);
            return Ok(());
        }

        self.client
            .query(&format!("DROP DATABASE {}", quote_identifier(name)))
            .await?;
        info!("Database {} dropped", name);
        Ok(())
    }
}
