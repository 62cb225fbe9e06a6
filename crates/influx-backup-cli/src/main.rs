//! influx-backup command line tool

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tracing_subscriber::EnvFilter;

use commands::Commands;
use influx_backup_core::{BackupManager, ManagerConfig};

#[derive(Parser)]
#[command(name = "influx-backup")]
#[command(about = "Backup, restore and sideload InfluxDB databases through influxd", version)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// YAML configuration file
    #[arg(short, long, global = true, env = "INFLUX_BACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// InfluxDB host
    #[arg(long, global = true, env = "INFLUX_BACKUP_HOST")]
    host: Option<String>,

    /// InfluxDB HTTP port
    #[arg(long, global = true, env = "INFLUX_BACKUP_PORT")]
    port: Option<u16>,

    /// Database to back up and restore into
    #[arg(short, long, global = true, env = "INFLUX_BACKUP_DATABASE")]
    database: Option<String>,

    #[arg(short, long, global = true, env = "INFLUX_BACKUP_USERNAME")]
    username: Option<String>,

    #[arg(short, long, global = true, env = "INFLUX_BACKUP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Folder for scratch directories
    #[arg(long, global = true, env = "INFLUX_BACKUP_TMP_FOLDER")]
    tmp_folder: Option<PathBuf>,

    /// Suffix of the temporary restore database
    #[arg(long, global = true, env = "INFLUX_BACKUP_SUFFIX")]
    suffix: Option<String>,

    /// Retention policy copied during sideload
    #[arg(long, global = true, env = "INFLUX_BACKUP_RETENTION_POLICY")]
    retention_policy: Option<String>,

    /// influxd backup/restore RPC port
    #[arg(long, global = true, env = "INFLUX_BACKUP_BACKUP_PORT")]
    backup_port: Option<u16>,

    /// Path to the influxd binary
    #[arg(long, global = true, env = "INFLUX_BACKUP_INFLUXD")]
    influxd: Option<PathBuf>,
}

impl ConnectionArgs {
    fn into_config(self) -> Result<ManagerConfig> {
        let mut config = match &self.config {
            Some(path) => ManagerConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => ManagerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(database) = self.database {
            config.database = database;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if self.password.is_some() {
            config.password = self.password;
        }
        if let Some(tmp_folder) = self.tmp_folder {
            config.tmp_folder = tmp_folder;
        }
        if let Some(suffix) = self.suffix {
            config.suffix = suffix;
        }
        if let Some(retention_policy) = self.retention_policy {
            config.retention_policy = retention_policy;
        }
        if let Some(backup_port) = self.backup_port {
            config.backup_port = backup_port;
        }
        if let Some(influxd) = self.influxd {
            config.binary = influxd;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("influx_backup=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.connection.into_config()?;

    let manager = BackupManager::new(config).context("Failed to create backup manager")?;
    manager
        .init()
        .await
        .context("Failed to initialize backup manager")?;

    commands::run(&manager, cli.command).await
}
