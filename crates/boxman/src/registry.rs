//! Registry of provisioned projects.
//!
//! A JSON map of project name to config path under the user's config
//! directory. Every read-modify-write happens under an exclusive `flock`
//! on a sibling lock file, so concurrent invocations cannot both claim the
//! same project name.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::default_config_dir;

const REGISTRY_FILE: &str = "projects.json";
const LOCK_FILE: &str = ".projects.lock";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry file {path} is corrupt: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("project {project} is already registered from {} (use --force to take it over)", existing.display())]
    Collision { project: String, existing: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub conf: PathBuf,
    pub registered_at: DateTime<Utc>,
}

/// What `register` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    New,
    /// Already registered from the same config file.
    Existing,
    /// Taken over from another config file.
    Replaced { previous: PathBuf },
}

/// Held for the duration of one read-modify-write; closing the file
/// releases the lock.
struct LockGuard {
    _file: File,
}

impl LockGuard {
    fn acquire(path: &Path) -> Result<Self, RegistryError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|source| RegistryError::Lock {
                path: path.to_path_buf(),
                source,
            })?;
        // SAFETY: the descriptor is owned by `file` and stays open for the
        // lifetime of the guard.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(RegistryError::Lock {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { _file: file })
    }
}

pub struct ProjectRegistry {
    dir: PathBuf,
}

impl ProjectRegistry {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.config/boxman/cache`.
    #[must_use]
    pub fn default_location() -> Self {
        Self::new(default_config_dir().join("cache"))
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    /// Record `project` as provisioned from `conf`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Collision`] if the project is registered
    /// from a different config file and `force` is off.
    pub fn register(
        &self,
        project: &str,
        conf: &Path,
        force: bool,
    ) -> Result<Registration, RegistryError> {
        let conf = std::fs::canonicalize(conf).unwrap_or_else(|_| conf.to_path_buf());
        let _lock = self.lock()?;
        let mut entries = self.read()?;

        let registration = match entries.get(project) {
            Some(entry) if entry.conf == conf => {
                debug!(project = %project, "Project already registered");
                return Ok(Registration::Existing);
            }
            Some(entry) if !force => {
                return Err(RegistryError::Collision {
                    project: project.to_string(),
                    existing: entry.conf.clone(),
                });
            }
            Some(entry) => {
                warn!(project = %project, previous = %entry.conf.display(), "Taking over project registration");
                Registration::Replaced {
                    previous: entry.conf.clone(),
                }
            }
            None => Registration::New,
        };

        entries.insert(
            project.to_string(),
            ProjectEntry {
                conf: conf.clone(),
                registered_at: Utc::now(),
            },
        );
        self.write(&entries)?;
        info!(project = %project, conf = %conf.display(), "Project registered");
        Ok(registration)
    }

    /// Remove `project`. Returns whether it was registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked, read or written.
    pub fn unregister(&self, project: &str) -> Result<bool, RegistryError> {
        let _lock = self.lock()?;
        let mut entries = self.read()?;
        if entries.remove(project).is_none() {
            return Ok(false);
        }
        self.write(&entries)?;
        info!(project = %project, "Project unregistered");
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked or read.
    pub fn list(&self) -> Result<BTreeMap<String, ProjectEntry>, RegistryError> {
        let _lock = self.lock()?;
        self.read()
    }

    /// # Errors
    ///
    /// Returns an error if the registry cannot be locked or read.
    pub fn lookup(&self, project: &str) -> Result<Option<ProjectEntry>, RegistryError> {
        Ok(self.list()?.remove(project))
    }

    fn lock(&self) -> Result<LockGuard, RegistryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        LockGuard::acquire(&self.dir.join(LOCK_FILE))
    }

    fn read(&self) -> Result<BTreeMap<String, ProjectEntry>, RegistryError> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| RegistryError::Parse { path, source })
    }

    /// Write to a temporary file and rename it over the registry.
    fn write(&self, entries: &BTreeMap<String, ProjectEntry>) -> Result<(), RegistryError> {
        let path = self.path();
        let tmp = self.dir.join(format!("{REGISTRY_FILE}.tmp"));
        let json = serde_json::to_string_pretty(entries).map_err(|source| RegistryError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, json).map_err(|source| RegistryError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| RegistryError::Io { path, source })
    }
}
