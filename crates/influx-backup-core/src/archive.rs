//! Zip packing of influxd backup output and unpacking of uploaded archives

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{BackupError, Result};

/// Files the archiver never picks up: other archives and dot-files
pub fn is_excluded(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(".zip")
}

/// Zip every eligible file below `source_dir` into `dest`
pub async fn write_archive(source_dir: &Path, dest: &Path) -> Result<PathBuf> {
    let source_dir = source_dir.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || write_archive_blocking(&source_dir, &dest)).await?
}

/// Extract `archive` into `target_dir`, returning the extracted file paths
pub async fn extract_archive(archive: &Path, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let archive = archive.to_path_buf();
    let target_dir = target_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_archive_blocking(&archive, &target_dir)).await?
}

fn collect_files(source_dir: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    let mut pending = vec![(source_dir.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_excluded(&name) {
                continue;
            }

            let entry_name = format!("{}{}", prefix, name);
            if entry.file_type()?.is_dir() {
                pending.push((entry.path(), format!("{}/", entry_name)));
            } else {
                files.push((entry.path(), entry_name));
            }
        }
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[instrument(skip_all, fields(source = ?source_dir))]
fn write_archive_blocking(source_dir: &Path, dest: &Path) -> Result<PathBuf> {
    let files = collect_files(source_dir).map_err(|e| BackupError::Archive(e.to_string()))?;

    let output = File::create(dest).map_err(|e| BackupError::Archive(e.to_string()))?;
    let mut zip = ZipWriter::new(BufWriter::new(output));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (path, name) in &files {
        zip.start_file(name.as_str(), options)?;
        let mut input = File::open(path).map_err(|e| BackupError::Archive(e.to_string()))?;
        io::copy(&mut input, &mut zip).map_err(|e| BackupError::Archive(e.to_string()))?;
    }

    let mut writer = zip.finish()?;
    writer
        .flush()
        .map_err(|e| BackupError::Archive(e.to_string()))?;

    debug!("Archived {} files into {:?}", files.len(), dest);
    Ok(dest.to_path_buf())
}

#[instrument(skip_all, fields(archive = ?archive))]
fn extract_archive_blocking(archive: &Path, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let decompress = |e: &dyn std::fmt::Display| BackupError::Decompress(e.to_string());

    let file = File::open(archive).map_err(|e| decompress(&e))?;
    let mut zip = ZipArchive::new(BufReader::new(file)).map_err(|e| decompress(&e))?;
    let mut extracted = Vec::with_capacity(zip.len());

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| decompress(&e))?;
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                return Err(BackupError::Decompress(format!(
                    "entry {:?} escapes the target directory",
                    entry.name()
                )))
            }
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(BackupError::Decompress(format!(
                "entry {:?} escapes the target directory",
                entry.name()
            )));
        }

        let out_path = target_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| decompress(&e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| decompress(&e))?;
        }
        let mut output = File::create(&out_path).map_err(|e| decompress(&e))?;
        io::copy(&mut entry, &mut output).map_err(|e| decompress(&e))?;
        extracted.push(out_path);
    }

    debug!("Extracted {} files into {:?}", extracted.len(), target_dir);
    Ok(extracted)
}
