// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the configuration file that depwatch reads once at
//! startup. The configuration names the one package to track, the command to
//! run when that package gets a new release, the directories to run the
//! command in, and where the last applied version is recorded.
//!
//! # Formats
//!
//! TOML is the native format. JSON is also accepted so that existing
//! deployments can keep their `_config.json` files, which is why the older
//! camelCase keys `dependencyName`, `updateScript`, and `appFolders` are
//! recognized as aliases. Unknown keys are ignored.
//!
//! ```toml
//! package_name = "bse-admin"
//! update_command = "npm update bse-admin"
//! target_directories = ["/srv/apps/foo", "/srv/apps/bar"]
//!
//! [registry]
//! kind = "npm"
//! url = "https://registry.npmjs.org"
//!
//! [schedule]
//! interval_secs = 3600
//! ```

use crate::path::{default_version_file, VERSION_FILE_NAME};

use serde::Deserialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default npm registry endpoint.
pub const DEFAULT_NPM_REGISTRY: &str = "https://registry.npmjs.org";

/// Updater configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct UpdaterConfig {
    /// Name of the package to track in the registry.
    #[serde(default, alias = "dependencyName")]
    pub package_name: String,

    /// Command template to run in each target directory on update.
    #[serde(default, alias = "updateScript")]
    pub update_command: String,

    /// Directories to run the update command in.
    #[serde(default, alias = "appFolders")]
    pub target_directories: Vec<TargetDirectory>,

    /// Directory holding the version file.
    #[serde(default, alias = "stateDirectory")]
    pub state_directory: Option<PathBuf>,

    /// Explicit path to the version file, overrides state directory.
    #[serde(default, alias = "versionFile")]
    pub version_file: Option<PathBuf>,

    /// Where to look up the latest published version.
    #[serde(default)]
    pub registry: RegistrySettings,

    /// How often to check for a new version.
    #[serde(default)]
    pub schedule: ScheduleSettings,
}

impl UpdaterConfig {
    /// Load configuration from file.
    ///
    /// Files ending in `.json` are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] or [`ConfigError::DeserializeJson`]
    ///   if parsing fails.
    /// - Return [`ConfigError::MissingField`] if a required field is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&data),
            _ => data.parse(),
        }
    }

    /// Parse configuration from JSON data.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::DeserializeJson`] if parsing fails.
    /// - Return [`ConfigError::MissingField`] if a required field is absent.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: UpdaterConfig =
            serde_json::from_str(data).map_err(ConfigError::DeserializeJson)?;
        config.finish()
    }

    /// Check that all required fields are present.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingField`] naming the first field found
    ///   missing or blank.
    pub fn validate(&self) -> Result<()> {
        require("update_command", &self.update_command)?;
        require("package_name", &self.package_name)?;
        Ok(())
    }

    /// Determine path to version file.
    ///
    /// An explicit version file wins over the state directory. Without
    /// either, the default state directory is used.
    pub fn version_file_path(&self) -> PathBuf {
        match (&self.version_file, &self.state_directory) {
            (Some(file), _) => file.clone(),
            (None, Some(dir)) => dir.join(VERSION_FILE_NAME),
            (None, None) => default_version_file(),
        }
    }

    fn finish(mut self) -> Result<Self> {
        // INVARIANT: Perform shell expansion on every path field.
        self.target_directories = self
            .target_directories
            .iter()
            .map(|target| expand_path(target.as_path()).map(TargetDirectory::new))
            .collect::<Result<Vec<_>>>()?;
        self.state_directory = self.state_directory.as_deref().map(expand_path).transpose()?;
        self.version_file = self.version_file.as_deref().map(expand_path).transpose()?;

        self.validate()?;
        Ok(self)
    }
}

impl FromStr for UpdaterConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let config: UpdaterConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;
        config.finish()
    }
}

/// Registry lookup settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistrySettings {
    /// Query an npm compatible registry over HTTP.
    Npm {
        /// Base URL of the registry.
        #[serde(default = "default_npm_url")]
        url: String,

        /// Request timeout in seconds.
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },

    /// Ask an external command, e.g., `npm view {package} version`.
    Command {
        /// Command template, `{package}` is replaced by the package name.
        command: String,
    },
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::Npm {
            url: default_npm_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Schedule settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct ScheduleSettings {
    /// Seconds between two checks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Check once immediately instead of waiting a full interval.
    #[serde(default = "default_run_on_start")]
    pub run_on_start: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            run_on_start: default_run_on_start(),
        }
    }
}

/// Directory that the update command runs in.
#[derive(Default, Debug, PartialEq, Eq, Clone, Hash, Deserialize)]
pub struct TargetDirectory(PathBuf);

impl TargetDirectory {
    /// Construct new target directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Leaf name of target directory.
    ///
    /// Trailing separators are ignored, so `/srv/apps/foo/` yields `foo`.
    /// Paths without a leaf, e.g., `/`, yield [`None`].
    pub fn basename(&self) -> Option<String> {
        self.0
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Treat target directory as [`Path`] slice.
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Display for TargetDirectory {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_path().to_string_lossy().as_ref())
    }
}

impl From<PathBuf> for TargetDirectory {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for TargetDirectory {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&str> for TargetDirectory {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

pub(crate) fn require(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(field));
    }

    Ok(())
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(&path.to_string_lossy())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

fn default_npm_url() -> String {
    DEFAULT_NPM_REGISTRY.into()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_run_on_start() -> bool {
    true
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration at {:?}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to deserialize TOML configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to deserialize JSON configuration.
    #[error(transparent)]
    DeserializeJson(#[from] serde_json::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Required field was not set.
    #[error("required field {0:?} was not set in configuration")]
    MissingField(&'static str),

    /// Schedule interval is zero or too long.
    #[error("schedule interval must be greater than zero and at most 366 days")]
    InvalidInterval,
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
