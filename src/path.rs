// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations for the files depwatch reads and writes when
//! configuration does not say otherwise.

use std::path::PathBuf;

/// Name of the file holding the last applied package version.
pub const VERSION_FILE_NAME: &str = "version.txt";

/// Name of the default state directory.
pub const STATE_DIR_NAME: &str = "temp";

/// Determine default path to state directory.
///
/// The state directory is relative to the working directory of the process,
/// so the returned path is left relative on purpose. Does not check if the
/// path returned actually exists.
pub fn default_state_dir() -> PathBuf {
    PathBuf::from(STATE_DIR_NAME)
}

/// Determine default path to version file.
pub fn default_version_file() -> PathBuf {
    default_state_dir().join(VERSION_FILE_NAME)
}

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/depwatch/config.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoConfigDir`] if configuration directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("depwatch").join("config.toml"))
        .ok_or(NoConfigDir)
}

/// No way to determine user's configuration directory.
///
/// # See Also
///
/// - [`dirs::config_dir`](https://docs.rs/dirs/latest/dirs/fn.config_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine path to user's configuration directory")]
pub struct NoConfigDir;

/// Friendly result alias :3
pub type Result<T, E = NoConfigDir> = std::result::Result<T, E>;
