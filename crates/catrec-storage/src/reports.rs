use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// One file of a run report, relative to the run directory.
#[derive(Debug, Clone)]
pub struct ReportFile {
    pub relative_path: PathBuf,
    pub bytes: Vec<u8>,
}

impl ReportFile {
    pub fn new(relative_path: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            relative_path: relative_path.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub relative_path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone)]
pub struct CommittedReport {
    pub dir: PathBuf,
    pub files: Vec<StoredFile>,
    /// An earlier report for the same run id was swapped out.
    pub replaced: bool,
}

/// Run reports under `<root>/<run_id>/`, committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Writes every file into a hidden staging directory, then renames it
    /// into place. Readers see either the previous report or the complete
    /// new one, never a mix.
    pub async fn commit(&self, run_id: &str, files: &[ReportFile]) -> anyhow::Result<CommittedReport> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating report root {}", self.root.display()))?;

        let staging = self.root.join(format!(".{run_id}.{}.staging", Uuid::new_v4()));
        let stored = match write_all(&staging, files).await {
            Ok(stored) => stored,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging).await;
                return Err(err);
            }
        };

        let final_dir = self.run_dir(run_id);
        let replaced = fs::try_exists(&final_dir)
            .await
            .with_context(|| format!("checking report dir {}", final_dir.display()))?;

        if replaced {
            let retired = self.root.join(format!(".{run_id}.{}.old", Uuid::new_v4()));
            fs::rename(&final_dir, &retired).await.with_context(|| {
                format!("retiring {} -> {}", final_dir.display(), retired.display())
            })?;
            if let Err(err) = fs::rename(&staging, &final_dir).await {
                let _ = fs::rename(&retired, &final_dir).await;
                let _ = fs::remove_dir_all(&staging).await;
                return Err(err).with_context(|| format!("committing report {}", final_dir.display()));
            }
            let _ = fs::remove_dir_all(&retired).await;
        } else {
            fs::rename(&staging, &final_dir)
                .await
                .with_context(|| format!("committing report {}", final_dir.display()))?;
        }

        Ok(CommittedReport {
            dir: final_dir,
            files: stored,
            replaced,
        })
    }
}

async fn write_all(dir: &Path, files: &[ReportFile]) -> anyhow::Result<Vec<StoredFile>> {
    let mut stored = Vec::with_capacity(files.len());
    for file in files {
        let path = dir.join(&file.relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, &file.bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        stored.push(StoredFile {
            relative_path: file.relative_path.clone(),
            sha256: ReportStore::sha256_hex(&file.bytes),
            byte_size: file.bytes.len(),
        });
    }
    Ok(stored)
}

/// Replaces `path` with `bytes` through a temp file and rename.
pub async fn write_file_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}
