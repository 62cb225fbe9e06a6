pub mod archive;
pub mod client;
pub mod config;
pub mod errors;
pub mod manager;
pub mod process;
pub mod queue;
pub mod scratch;

pub use client::{HttpInfluxClient, InfluxClient, PingStatus, StatementResult};
pub use config::ManagerConfig;
pub use errors::{BackupError, Result};
pub use manager::{BackupArchive, BackupManager, BackupOptions};
pub use process::{InfluxdRunner, ProcessRunner};
pub use queue::ProcessQueue;
pub use scratch::ScratchDir;
