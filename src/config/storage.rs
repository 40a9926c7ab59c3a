//! Configuration Storage
//!
//! Reads and writes the forwards file and settings.
//! Location: ~/.oxidetunnel on macOS/Linux, %APPDATA%\OxideTunnel on Windows

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::types::{ForwardFile, ForwardingSettings, FORWARDS_VERSION};
use crate::forwarding::ForwardingRecord;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Forwards file version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Returns %APPDATA%\OxideTunnel on Windows, ~/.oxidetunnel elsewhere
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTunnel"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn forwards_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("forwards.json"))
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Load settings from `path`; a missing file means defaults
pub async fn load_settings_from(path: &Path) -> Result<ForwardingSettings, StorageError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ForwardingSettings::default()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Load settings from the default settings.json
pub async fn load_settings() -> Result<ForwardingSettings, StorageError> {
    load_settings_from(&settings_file()?).await
}

/// Persists forwarding records
///
/// Writes are serialized so two saves never interleave their temp files.
pub struct ForwardStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ForwardStorage {
    /// Storage at the default forwards.json path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(forwards_file()?))
    }

    /// Storage at a custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load records from disk
    ///
    /// A missing file yields no records. A corrupted file is backed up and
    /// treated as empty.
    pub async fn load(&self) -> Result<Vec<ForwardingRecord>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        match serde_json::from_str::<ForwardFile>(&contents) {
            Ok(file) if file.version > FORWARDS_VERSION => Err(StorageError::VersionTooNew {
                found: file.version,
                supported: FORWARDS_VERSION,
            }),
            Ok(file) => {
                debug!("Loaded {} forward(s) from {:?}", file.forwards.len(), self.path);
                Ok(file.forwards)
            }
            Err(e) => {
                warn!("Forwards file corrupted: {}", e);
                match self.backup().await {
                    Ok(backup_path) => {
                        warn!("Corrupted forwards file backed up to {:?}", backup_path)
                    }
                    Err(backup_err) => {
                        error!("Failed to back up corrupted forwards file: {}", backup_err)
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    /// Write records to disk (temp file + rename)
    pub async fn save(&self, forwards: Vec<ForwardingRecord>) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_dir().await?;

        let file = ForwardFile {
            version: FORWARDS_VERSION,
            forwards,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(json.as_bytes()).await?;
        out.sync_all().await?;
        drop(out);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Copy the current file aside with a timestamp suffix
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if fs::metadata(&self.path).await.is_ok() {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
