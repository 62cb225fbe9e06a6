//! Scratch directory helpers
//!
//! Scratch directories live under the configured temp folder and are named by
//! a random UUID. [`ScratchDir`] ties a directory to the operation that made
//! it: the directory is removed by [`ScratchDir::release`] or, failing that,
//! when the guard is dropped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::Result;

/// Random hyphenated hex token used to name scratch directories
pub fn generate_token() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

/// Create a directory (and its parents). An existing directory is not an error.
pub async fn create_directory(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove every entry below `dir`, keeping `dir` itself
pub async fn clear_directory(dir: &Path) -> Result<()> {
    let mut pending = vec![dir.to_path_buf()];
    let mut subdirs = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path.clone());
                subdirs.push(path);
            } else {
                fs::remove_file(&path).await?;
            }
        }
    }

    // Children were discovered after their parents
    for subdir in subdirs.iter().rev() {
        fs::remove_dir(subdir).await?;
    }
    Ok(())
}

/// Recursively remove `dir`. A missing directory counts as removed.
pub async fn remove_directory(dir: &Path) -> Result<()> {
    if fs::metadata(dir).await.is_err() {
        return Ok(());
    }

    clear_directory(dir).await?;
    match fs::remove_dir(dir).await {
        Ok(()) => {
            debug!("Removed directory {:?}", dir);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A uniquely named directory owned by one operation
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    /// Create a new scratch directory under `root`
    pub async fn create(root: &Path) -> Result<Self> {
        let path = root.join(generate_token());
        fs::create_dir(&path).await?;
        debug!("Created scratch directory {:?}", path);
        Ok(Self {
            path,
            released: false,
        })
    }

    /// Take ownership of an existing directory
    pub fn adopt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the directory to the caller; it will no longer be removed
    pub fn into_path(mut self) -> PathBuf {
        self.released = true;
        std::mem::take(&mut self.path)
    }

    /// Remove the directory and everything in it.
    ///
    /// This is the expected way to dispose of a guard. Dropping an unreleased
    /// guard falls back to a blocking `remove_dir_all` on the current thread,
    /// which only happens on early returns and cancelled futures.
    pub async fn release(mut self) -> Result<()> {
        let result = remove_directory(&self.path).await;
        self.released = true;
        result
    }
}

/// Blocking fallback for guards that were never released, e.g. when the
/// owning future is cancelled. Errors are logged, never raised.
impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed scratch directory {:?} on drop", self.path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch directory {:?}: {}", self.path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_token_format() {
        let token = generate_token();
        assert_eq!(token.len(), 36);
        assert_eq!(token.matches('-').count(), 4);
        assert!(token.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn test_create_directory_is_idempotent() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("nested").join("tmp");

        create_directory(&dir).await.unwrap();
        create_directory(&dir).await.unwrap();
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_remove_directory_with_nested_and_dot_files() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("work");
        std::fs::create_dir_all(dir.join("a").join("b")).unwrap();
        std::fs::write(dir.join(".gitkeep"), "").unwrap();
        std::fs::write(dir.join("meta.manifest"), "{}").unwrap();
        std::fs::write(dir.join("a").join("b").join("shard.tar.gz"), "data").unwrap();

        remove_directory(&dir).await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_remove_missing_directory() {
        let root = TempDir::new().unwrap();
        remove_directory(&root.path().join("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_directory_keeps_root() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("sub")).unwrap();
        std::fs::write(root.path().join("sub").join("f"), "x").unwrap();
        std::fs::write(root.path().join("g"), "y").unwrap();

        clear_directory(root.path()).await.unwrap();
        assert!(root.path().is_dir());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_scratch_dir_release() {
        let root = TempDir::new().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(path.join("file"), "x").unwrap();
        assert!(path.starts_with(root.path()));

        scratch.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let path = {
            let scratch = ScratchDir::create(root.path()).await.unwrap();
            std::fs::write(scratch.path().join("file"), "x").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_when_task_cancelled() {
        let root = TempDir::new().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let scratch_root = root.path().to_path_buf();

        let task = tokio::spawn(async move {
            let scratch = ScratchDir::create(&scratch_root).await.unwrap();
            tx.send(scratch.path().to_path_buf()).unwrap();
            std::future::pending::<()>().await;
            scratch.release().await
        });

        let path = rx.await.unwrap();
        assert!(path.is_dir());
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_into_path_keeps_directory() {
        let root = TempDir::new().unwrap();
        let scratch = ScratchDir::create(root.path()).await.unwrap();
        let path = scratch.into_path();
        assert!(path.is_dir());
    }
}
