//! Crash-safe persistence of the working set.
//!
//! Every save writes a temporary file next to the target and renames it over
//! the target, so a crash mid-write leaves the previous snapshot intact.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::item::Item;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid working set {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not replace {path} after {attempts} attempts: {source}")]
    RenameExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("working set {0} is locked by another run")]
    Locked(PathBuf),
    #[error("join error: {0}")]
    Join(String),
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persistence knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Items per batch; the working set is saved after each batch.
    pub batch_size: usize,
    /// Attempts at the final rename before giving up.
    pub rename_attempts: u32,
    #[serde(with = "crate::config::millis")]
    pub rename_delay: Duration,
    /// Copy the on-disk working set aside before the first batch.
    pub backup: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            rename_attempts: 5,
            rename_delay: Duration::from_secs(1),
            backup: true,
        }
    }
}

/// Read the working set. Failure here is fatal to the run.
pub async fn load_working_set(path: impl AsRef<Path>) -> Result<Vec<Item>, CheckpointError> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&path).map_err(|e| CheckpointError::io(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Decode {
            path: path.clone(),
            source,
        })
    })
    .await
    .map_err(|e| CheckpointError::Join(e.to_string()))?
}

/// Writes snapshots and backups of one working-set file.
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    config: CheckpointConfig,
}

impl Checkpointer {
    pub fn new(path: impl Into<PathBuf>, config: CheckpointConfig) -> Self {
        Self {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Copy the current file to `<file>.<YYYYmmdd_HHMMSS>.bak`. Existing
    /// backups are never overwritten; a counter is appended on collision.
    /// Returns `None` when there is nothing on disk yet.
    pub async fn backup(&self) -> Result<Option<PathBuf>, CheckpointError> {
        let path = self.path.clone();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let created = tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>, CheckpointError> {
            if !path.exists() {
                return Ok(None);
            }
            let base = format!("{}.{stamp}", path.display());
            let mut target = PathBuf::from(format!("{base}.bak"));
            let mut n = 1;
            while target.exists() {
                target = PathBuf::from(format!("{base}.{n}.bak"));
                n += 1;
            }
            std::fs::copy(&path, &target).map_err(|e| CheckpointError::io(&target, e))?;
            Ok(Some(target))
        })
        .await
        .map_err(|e| CheckpointError::Join(e.to_string()))??;

        if let Some(target) = &created {
            info!(backup = %target.display(), "created backup");
        }
        Ok(created)
    }

    /// Serialize `items` and atomically replace the working-set file.
    pub async fn save(&self, items: &[Item]) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(items)?;
        let path = self.path.clone();
        let mut pending = tokio::task::spawn_blocking(move || write_temp(&path, &json))
            .await
            .map_err(|e| CheckpointError::Join(e.to_string()))??;

        let attempts = self.config.rename_attempts.max(1);
        let mut attempt = 1;
        loop {
            let target = self.path.clone();
            let result = tokio::task::spawn_blocking(move || {
                pending.persist(&target).map(|_| ()).map_err(|e| (e.file, e.error))
            })
            .await
            .map_err(|e| CheckpointError::Join(e.to_string()))?;

            match result {
                Ok(()) => {
                    info!(path = %self.path.display(), items = items.len(), "checkpoint saved");
                    return Ok(());
                }
                Err((file, error)) if attempt < attempts => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        attempts,
                        error = %error,
                        "checkpoint target busy, retrying"
                    );
                    pending = file;
                    attempt += 1;
                    tokio::time::sleep(self.config.rename_delay).await;
                }
                Err((_file, error)) => {
                    return Err(CheckpointError::RenameExhausted {
                        path: self.path.clone(),
                        attempts,
                        source: error,
                    });
                }
            }
        }
    }
}

fn write_temp(path: &Path, bytes: &[u8]) -> Result<NamedTempFile, CheckpointError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| CheckpointError::io(&dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CheckpointError::io(tmp.path(), e))?;
    Ok(tmp)
}

/// Exclusive advisory lock held for the duration of a run.
#[derive(Debug)]
pub struct WorkingSetLock {
    _file: std::fs::File,
}

impl WorkingSetLock {
    /// Lock `<file>.lock`, failing immediately if another run holds it.
    pub fn acquire(working_set: &Path) -> Result<Self, CheckpointError> {
        let lock_path = PathBuf::from(format!("{}.lock", working_set.display()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| CheckpointError::io(&lock_path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| CheckpointError::Locked(working_set.to_path_buf()))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn items() -> Vec<Item> {
        vec![
            Item::new("a", "alpha").with_result("morphologic", json!({"tokens": ["alpha"]})),
            Item::new("b", "beta"),
        ]
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        let cp = Checkpointer::new(&path, CheckpointConfig::default());

        cp.save(&items()).await.unwrap();
        let loaded = load_working_set(&path).await.unwrap();
        assert_eq!(loaded, items());

        // No temp files left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("work.json")]);
    }

    #[tokio::test]
    async fn backups_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        let cp = Checkpointer::new(&path, CheckpointConfig::default());

        assert!(cp.backup().await.unwrap().is_none());

        cp.save(&items()).await.unwrap();
        let first = cp.backup().await.unwrap().unwrap();
        let second = cp.backup().await.unwrap().unwrap();
        assert_ne!(first, second);
        assert!(first.exists() && second.exists());
        assert!(first.to_string_lossy().ends_with(".bak"));
        assert_eq!(
            std::fs::read(&first).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn load_reports_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_working_set(&missing).await,
            Err(CheckpointError::Io { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            load_working_set(&bad).await,
            Err(CheckpointError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn rename_into_directory_exhausts_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory at the target path makes every rename fail.
        let target = dir.path().join("work.json");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "x").unwrap();

        let cp = Checkpointer::new(
            &target,
            CheckpointConfig {
                rename_attempts: 3,
                rename_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        match cp.save(&items()).await {
            Err(CheckpointError::RenameExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RenameExhausted, got {other:?}"),
        }
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        let _held = WorkingSetLock::acquire(&path).unwrap();
        assert!(matches!(
            WorkingSetLock::acquire(&path),
            Err(CheckpointError::Locked(_))
        ));
    }
}
