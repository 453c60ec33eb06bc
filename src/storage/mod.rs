use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::backup::Job;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("settings I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no profile at index {0}")]
    NotFound(usize),
    #[error("profile name must not be empty")]
    EmptyName,
    #[error("at least one profile must exist")]
    LastProfile,
}

/// On-disk shape. Keys owned by other tools (window geometry and the like)
/// are carried through untouched.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    jobs: Vec<Job>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Profiles persisted in a JSON settings file.
#[derive(Clone)]
pub struct ProfileStore {
    path: PathBuf,
    settings: Arc<RwLock<SettingsFile>>,
}

impl ProfileStore {
    /// Open the store. A missing file means no profiles yet; a `"Default"`
    /// profile is provided so there is always something to edit.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let settings = read_settings(&path)?;
        info!("Loaded {} profiles from {}", settings.jobs.len(), path.display());
        Ok(Self {
            path,
            settings: Arc::new(RwLock::new(with_default(settings))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reload(&self) -> Result<usize, StorageError> {
        let settings = with_default(read_settings(&self.path)?);
        let count = settings.jobs.len();
        *self.settings.write() = settings;
        info!("Reloaded {} profiles", count);
        Ok(count)
    }

    pub fn list(&self) -> Vec<Job> {
        self.settings.read().jobs.clone()
    }

    pub fn get(&self, index: usize) -> Result<Job, StorageError> {
        self.settings
            .read()
            .jobs
            .get(index)
            .cloned()
            .ok_or(StorageError::NotFound(index))
    }

    pub fn add(&self, name: &str) -> Result<usize, StorageError> {
        let name = clean_name(name)?;
        self.mutate(|jobs| {
            jobs.push(Job::new(name));
            Ok(jobs.len() - 1)
        })
    }

    pub fn update(&self, index: usize, job: Job) -> Result<(), StorageError> {
        self.mutate(|jobs| {
            let slot = jobs.get_mut(index).ok_or(StorageError::NotFound(index))?;
            *slot = job;
            Ok(())
        })
    }

    pub fn rename(&self, index: usize, name: &str) -> Result<(), StorageError> {
        let name = clean_name(name)?;
        self.mutate(|jobs| {
            let job = jobs.get_mut(index).ok_or(StorageError::NotFound(index))?;
            job.name = name;
            Ok(())
        })
    }

    /// Copy a profile and insert the copy right after it.
    pub fn duplicate(&self, index: usize) -> Result<usize, StorageError> {
        self.mutate(|jobs| {
            let mut copy = jobs.get(index).cloned().ok_or(StorageError::NotFound(index))?;
            copy.name.push_str(" (copy)");
            jobs.insert(index + 1, copy);
            Ok(index + 1)
        })
    }

    pub fn remove(&self, index: usize) -> Result<Job, StorageError> {
        self.mutate(|jobs| {
            if index >= jobs.len() {
                return Err(StorageError::NotFound(index));
            }
            if jobs.len() == 1 {
                return Err(StorageError::LastProfile);
            }
            Ok(jobs.remove(index))
        })
    }

    pub fn save(&self) -> Result<(), StorageError> {
        write_settings(&self.path, &self.settings.write())
    }

    /// Apply a change and persist it while holding the write lock. The
    /// in-memory profiles are restored if either step fails.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<Job>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut settings = self.settings.write();
        let before = settings.jobs.clone();

        let result = change(&mut settings.jobs).and_then(|value| {
            write_settings(&self.path, &settings)?;
            Ok(value)
        });
        if result.is_err() {
            settings.jobs = before;
        }
        result
    }
}

/// Write via a temporary file and rename so a crash never leaves a
/// half-written settings file behind.
fn write_settings(path: &Path, settings: &SettingsFile) -> Result<(), StorageError> {
    let data = serde_json::to_string_pretty(settings).map_err(|source| StorageError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;

    debug!("Saved settings to {}", path.display());
    Ok(())
}

fn read_settings(path: &Path) -> Result<SettingsFile, StorageError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SettingsFile::default()),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&data).map_err(|source| StorageError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn with_default(mut settings: SettingsFile) -> SettingsFile {
    if settings.jobs.is_empty() {
        settings.jobs.push(Job::new("Default"));
    }
    settings
}

fn clean_name(name: &str) -> Result<String, StorageError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(StorageError::EmptyName);
    }
    Ok(name.to_string())
}
