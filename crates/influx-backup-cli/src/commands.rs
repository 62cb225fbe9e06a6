//! Backup and restore subcommands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;

use influx_backup_core::manager::parse_instant;
use influx_backup_core::{BackupManager, BackupOptions};

#[derive(Subcommand)]
pub enum Commands {
    /// Check that InfluxDB is reachable and supported
    Check,

    /// Create a backup archive
    Backup {
        /// Only back up data from this instant (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Only back up data until this instant (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Archive name (defaults to backup_<start>_<end>.zip)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory the archive is written to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },

    /// Restore a backup archive and sideload it into the database
    Restore {
        /// Backup zip file
        archive: PathBuf,

        /// Stop after restoring into the temporary database
        #[arg(long)]
        no_load: bool,
    },

    /// Sideload the temporary restore database into the main database
    Load,

    /// Drop a database if it exists
    Drop {
        /// Database name
        name: String,
    },
}

pub async fn run(manager: &BackupManager, command: Commands) -> Result<()> {
    match command {
        Commands::Check => {
            println!(
                "InfluxDB at {}:{} is ready",
                manager.config().host,
                manager.config().port
            );
            Ok(())
        }
        Commands::Backup {
            start,
            end,
            name,
            output,
        } => create_backup(manager, start, end, name, output).await,
        Commands::Restore { archive, no_load } => restore_backup(manager, archive, no_load).await,
        Commands::Load => {
            manager
                .load_backup()
                .await
                .context("Failed to sideload backup database")?;
            println!("Backup database loaded into {}", manager.config().database);
            Ok(())
        }
        Commands::Drop { name } => {
            manager
                .drop_database(&name)
                .await
                .with_context(|| format!("Failed to drop database {}", name))?;
            println!("Database {} dropped", name);
            Ok(())
        }
    }
}

async fn create_backup(
    manager: &BackupManager,
    start: Option<String>,
    end: Option<String>,
    name: Option<String>,
    output: PathBuf,
) -> Result<()> {
    let options = BackupOptions {
        start: start
            .as_deref()
            .map(parse_instant)
            .transpose()
            .context("Invalid --start")?,
        end: end
            .as_deref()
            .map(parse_instant)
            .transpose()
            .context("Invalid --end")?,
        file_name: name,
    };

    let archive = manager.backup(options).await.context("Backup failed")?;
    let path = archive
        .persist(&output)
        .await
        .context("Failed to move backup archive")?;

    println!("Backup created at: {}", path.display());
    Ok(())
}

async fn restore_backup(manager: &BackupManager, archive: PathBuf, no_load: bool) -> Result<()> {
    if !archive.is_file() {
        return Err(anyhow::anyhow!(
            "Backup archive {} not found",
            archive.display()
        ));
    }
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .context("Backup archive name is not valid UTF-8")?
        .to_string();

    // restore() deletes its directory, so work on a copy of the archive
    let restore_dir = manager.create_dir().await?;
    if let Err(e) = tokio::fs::copy(&archive, restore_dir.join(&file_name)).await {
        manager.delete_dir(&restore_dir).await.ok();
        return Err(e).context("Failed to stage backup archive");
    }

    info!("Restoring {} into {}", archive.display(), manager.config().backup_database());
    manager
        .restore(&restore_dir, &file_name)
        .await
        .context("Restore failed")?;

    if no_load {
        println!(
            "Backup restored into {}",
            manager.config().backup_database()
        );
        return Ok(());
    }

    manager
        .load_backup()
        .await
        .context("Failed to sideload restored data")?;
    println!("Backup restored into {}", manager.config().database);
    Ok(())
}
