//! Admin credential references.
//!
//! The `admin_pass` field of a cluster accepts three forms:
//!
//! ```yaml
//! admin_pass: s3cret                 # literal
//! admin_pass: file://~/.secrets/pw   # read from a file, trimmed
//! admin_pass: ${env:ADMIN_PASS}      # read from the environment
//! ```
//!
//! The form is decided once, when the configuration is parsed. The value is
//! only read by [`Credential::resolve`], right before it is needed.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::expand_home;

const FILE_PREFIX: &str = "file://";
const ENV_PREFIX: &str = "${env:";
const ENV_SUFFIX: &str = "}";

/// Credential resolution failures.
#[derive(Error, Debug)]
pub enum CredentialError {
    /// The referenced file could not be read.
    #[error("failed to read credential file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The referenced file exists but holds nothing after trimming.
    #[error("credential file {0} is empty")]
    EmptyFile(PathBuf),

    /// The referenced environment variable is not set.
    #[error("environment variable {0} is not set")]
    EnvNotSet(String),
}

/// Where an admin password comes from.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Credential {
    Literal(String),
    FileRef(PathBuf),
    EnvRef(String),
}

impl Credential {
    /// Classify a raw configuration value.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix(FILE_PREFIX) {
            return Self::FileRef(expand_home(Path::new(path)));
        }
        if let Some(name) = raw
            .strip_prefix(ENV_PREFIX)
            .and_then(|rest| rest.strip_suffix(ENV_SUFFIX))
        {
            if !name.is_empty() {
                return Self::EnvRef(name.to_string());
            }
        }
        Self::Literal(raw.to_string())
    }

    /// Produce the secret value.
    ///
    /// # Errors
    ///
    /// Returns an error if a referenced file cannot be read or is empty, or
    /// if a referenced environment variable is unset.
    pub async fn resolve(&self) -> Result<String, CredentialError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::FileRef(path) => {
                let content = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| CredentialError::File {
                        path: path.clone(),
                        source,
                    })?;
                let value = content.trim();
                if value.is_empty() {
                    return Err(CredentialError::EmptyFile(path.clone()));
                }
                Ok(value.to_string())
            }
            Self::EnvRef(name) => {
                std::env::var(name).map_err(|_| CredentialError::EnvNotSet(name.clone()))
            }
        }
    }
}

impl From<String> for Credential {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

// Literal values never show up in logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => f.write_str("Literal(***)"),
            Self::FileRef(path) => f.debug_tuple("FileRef").field(path).finish(),
            Self::EnvRef(name) => f.debug_tuple("EnvRef").field(name).finish(),
        }
    }
}
