// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version record persistence.
//!
//! Depwatch keeps exactly one piece of durable state: the __version record__.
//! The version record is the last package version whose update command was
//! applied to every target directory. It is stored as a plain text file that
//! holds the version string and nothing else.
//!
//! # Absence Is Not Failure
//!
//! A missing version record is the normal state of a fresh deployment, so
//! reading it yields [`None`] instead of an error. Every other read failure,
//! e.g., permission denied or the path being a directory, is reported as
//! [`StoreError::Read`] so that callers can tell the two apart.
//!
//! # Writing
//!
//! The record is replaced wholesale. New content is first written to a
//! sibling staging file which is then renamed over the record, so a reader
//! always sees either the old version or the new one.

use async_trait::async_trait;
use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, instrument};

/// Layer of indirection for version record access.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Read current version record, [`None`] if no record exists yet.
    async fn read(&self) -> Result<Option<String>>;

    /// Replace version record with new version.
    async fn write(&self, version: &str) -> Result<()>;
}

/// Version record kept in a plain text file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileVersionStore {
    path: PathBuf,
}

impl FileVersionStore {
    /// Construct new file store for version record at target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to version record.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn staging_path(&self) -> PathBuf {
        let mut name: OsString = self
            .path
            .file_name()
            .map(ToOwned::to_owned)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl VersionStore for FileVersionStore {
    /// Read version record from file.
    ///
    /// Content is returned exactly as stored, no trimming is performed.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if file exists but cannot be read.
    #[instrument(skip(self), level = "debug")]
    async fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(version) => {
                debug!("read local version {version:?} from {:?}", self.path.display());
                Ok(Some(version))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("no version record at {:?}", self.path.display());
                Ok(None)
            }
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Write version record to file.
    ///
    /// Creates the containing directory if it does not exist yet.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::CreateDir`] if containing directory cannot be
    ///   created.
    /// - Return [`StoreError::Write`] if record cannot be replaced.
    #[instrument(skip(self), level = "debug")]
    async fn write(&self, version: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let staging = self.staging_path();
        let result = match fs::write(&staging, version).await {
            Ok(()) => fs::rename(&staging, &self.path).await,
            Err(error) => Err(error),
        };

        if let Err(source) = result {
            // INVARIANT: Never leave a stale staging file behind.
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::Write {
                path: self.path.clone(),
                source,
            });
        }

        debug!("wrote version {version:?} to {:?}", self.path.display());
        Ok(())
    }
}

/// All possible error types for version record access.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Version record exists but cannot be read.
    #[error("failed to read version record at {:?}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory for version record cannot be created.
    #[error("failed to create state directory at {:?}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Version record cannot be written.
    #[error("failed to write version record at {:?}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = StoreError> = std::result::Result<T, E>;
