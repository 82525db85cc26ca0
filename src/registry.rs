// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Registry lookup.
//!
//! The __registry__ is the remote source of truth for published versions of
//! the tracked package. Depwatch only ever asks it one question: what is the
//! most recently published version of this package? Any mechanism that can
//! answer that question can serve as a registry through [`RegistryClient`].
//!
//! Two mechanisms are provided:
//!
//! - [`NpmRegistry`] fetches the package document from an npm compatible
//!   registry over HTTP.
//! - [`CommandRegistry`] asks an external command, e.g.,
//!   `npm view {package} version`, and takes the last line it prints.
//!
//! No answer is ever cached. Versions are opaque strings, no semantic version
//! ordering is performed here. "Most recent" means most recently published
//! according to the registry itself.

use crate::{
    action::{capture, shell},
    config::RegistrySettings,
};

use async_trait::async_trait;
use reqwest::{header::ACCEPT, StatusCode};
use serde::{de::IgnoredAny, Deserialize};
use std::{collections::HashMap, process::Stdio, time::Duration};
use tracing::{debug, info, instrument};

/// Token replaced by the package name in registry command templates.
pub const PACKAGE_PLACEHOLDER: &str = "{package}";

/// Layer of indirection for registry access.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve most recently published version of package.
    ///
    /// Yields [`None`] if the registry answered but named no version.
    async fn latest(&self, package: &str) -> Result<Option<String>>;
}

#[async_trait]
impl<T> RegistryClient for Box<T>
where
    T: RegistryClient + ?Sized,
{
    async fn latest(&self, package: &str) -> Result<Option<String>> {
        (**self).latest(package).await
    }
}

/// Construct registry client from configuration settings.
///
/// # Errors
///
/// - Return [`RegistryError::Client`] if HTTP client cannot be constructed.
pub fn from_settings(settings: &RegistrySettings) -> Result<Box<dyn RegistryClient>> {
    match settings {
        RegistrySettings::Npm { url, timeout_secs } => Ok(Box::new(NpmRegistry::new(
            url.as_str(),
            Duration::from_secs(*timeout_secs),
        )?)),
        RegistrySettings::Command { command } => Ok(Box::new(CommandRegistry::new(command.as_str()))),
    }
}

/// Registry access through npm registry HTTP API.
#[derive(Debug, Clone)]
pub struct NpmRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl NpmRegistry {
    /// Construct new npm registry client.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Client`] if HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("depwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RegistryError::Client)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    // INVARIANT: Scoped packages keep their "@" but must encode the "/".
    fn document_url(&self, package: &str) -> String {
        format!("{}/{}", self.base_url, package.replace('/', "%2F"))
    }
}

#[async_trait]
impl RegistryClient for NpmRegistry {
    /// Fetch package document and pick most recently published version.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::UnknownPackage`] if registry does not know
    ///   the package.
    /// - Return [`RegistryError::Status`] for any other unsuccessful status.
    /// - Return [`RegistryError::Request`] if registry is unreachable or
    ///   answers with an unreadable document.
    #[instrument(skip(self), level = "debug")]
    async fn latest(&self, package: &str) -> Result<Option<String>> {
        let url = self.document_url(package);
        debug!("fetch package document from {url}");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                package: package.into(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(RegistryError::UnknownPackage(package.into())),
            status if !status.is_success() => {
                return Err(RegistryError::Status {
                    package: package.into(),
                    status: status.as_u16(),
                })
            }
            _ => {}
        }

        let document: PackageDocument =
            response
                .json()
                .await
                .map_err(|source| RegistryError::Request {
                    package: package.into(),
                    source,
                })?;

        let latest = document.latest_published();
        if let Some(version) = &latest {
            info!("retrieve last version [{version}] for package: {package}");
        }

        Ok(latest)
    }
}

/// Subset of npm package document needed to find latest version.
#[derive(Debug, Default, Deserialize)]
struct PackageDocument {
    #[serde(default, rename = "dist-tags")]
    dist_tags: HashMap<String, String>,

    #[serde(default)]
    versions: HashMap<String, IgnoredAny>,

    #[serde(default)]
    time: HashMap<String, String>,
}

impl PackageDocument {
    /// Most recently published version.
    ///
    /// The "time" map also carries "created" and "modified" entries, which
    /// are dropped by only considering keys that name a published version.
    /// Falls back to the "latest" dist-tag if no publish times are known.
    fn latest_published(&self) -> Option<String> {
        self.time
            .iter()
            .filter(|(version, _)| self.versions.contains_key(*version))
            .max_by(|(lhs_version, lhs_time), (rhs_version, rhs_time)| {
                lhs_time.cmp(rhs_time).then_with(|| lhs_version.cmp(rhs_version))
            })
            .map(|(version, _)| version.clone())
            .or_else(|| self.dist_tags.get("latest").cloned())
    }
}

/// Registry access through external command.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    command: String,
}

impl CommandRegistry {
    /// Construct new command registry from command template.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl RegistryClient for CommandRegistry {
    /// Run command and take last non-empty line of its output as version.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Spawn`] if shell could not be started.
    /// - Return [`RegistryError::Command`] if command exits unsuccessfully.
    #[instrument(skip(self), level = "debug")]
    async fn latest(&self, package: &str) -> Result<Option<String>> {
        let command = self.command.replace(PACKAGE_PLACEHOLDER, package);
        debug!("ask {command:?} for latest version");

        let output = shell(&command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RegistryError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RegistryError::Command {
                command,
                code: output.status.code(),
                stderr: capture(&output.stderr),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let latest = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .map(ToString::to_string);

        if let Some(version) = &latest {
            info!("retrieve last version [{version}] for package: {package}");
        }

        Ok(latest)
    }
}

/// All possible error types for registry lookup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// HTTP client cannot be constructed.
    #[error("failed to construct registry client")]
    Client(#[source] reqwest::Error),

    /// Registry is unreachable or answered with garbage.
    #[error("failed to query registry for package {package:?}")]
    Request {
        package: String,
        #[source]
        source: reqwest::Error,
    },

    /// Registry does not know package.
    #[error("package {0:?} is unknown to registry")]
    UnknownPackage(String),

    /// Registry answered with unsuccessful status.
    #[error("registry answered with status {status} for package {package:?}")]
    Status { package: String, status: u16 },

    /// Registry command could not be started.
    #[error("failed to start registry command {command:?}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Registry command exited unsuccessfully.
    #[error("registry command {command:?} failed with exit code {code:?}: {stderr}")]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Registry named no version for package.
    #[error("registry named no version for package {0:?}")]
    NoVersion(String),
}

/// Friendly result alias :3
type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn registry(server: &MockServer) -> NpmRegistry {
        NpmRegistry::new(format!("{}/", server.uri()), Duration::from_secs(2))
            .unwrap_or_else(|error| panic!("cannot build client: {error}"))
    }

    #[tokio::test]
    async fn npm_picks_most_recently_published_version() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bse-admin"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "bse-admin",
                "dist-tags": { "latest": "2.0.0" },
                "versions": { "1.0.0": {}, "2.0.0": {}, "1.9.1": {} },
                "time": {
                    "created": "2014-01-01T00:00:00.000Z",
                    "modified": "2016-01-01T00:00:00.000Z",
                    "1.0.0": "2014-01-01T00:00:00.000Z",
                    "2.0.0": "2015-01-01T00:00:00.000Z",
                    "1.9.1": "2015-06-01T00:00:00.000Z"
                }
            })))
            .mount(&server)
            .await;

        let result = registry(&server).latest("bse-admin").await?;
        assert_eq!(result, Some("1.9.1".into()));

        Ok(())
    }

    #[tokio::test]
    async fn npm_falls_back_to_latest_dist_tag() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bse-admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dist-tags": { "latest": "3.1.4" },
                "versions": { "3.1.4": {} }
            })))
            .mount(&server)
            .await;

        let result = registry(&server).latest("bse-admin").await?;
        assert_eq!(result, Some("3.1.4".into()));

        Ok(())
    }

    #[tokio::test]
    async fn npm_document_without_versions_names_nothing() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bse-admin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "bse-admin" })))
            .mount(&server)
            .await;

        assert_eq!(registry(&server).latest("bse-admin").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn npm_encodes_scoped_package_names() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/@bem%2Fsite"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dist-tags": { "latest": "0.4.0" }
            })))
            .mount(&server)
            .await;

        let result = registry(&server).latest("@bem/site").await?;
        assert_eq!(result, Some("0.4.0".into()));

        Ok(())
    }

    #[tokio::test]
    async fn npm_reports_unknown_package_and_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = registry(&server);
        assert!(matches!(
            client.latest("missing").await,
            Err(RegistryError::UnknownPackage(name)) if name == "missing"
        ));
        assert!(matches!(
            client.latest("broken").await,
            Err(RegistryError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn npm_reports_garbage_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert!(matches!(
            registry(&server).latest("garbage").await,
            Err(RegistryError::Request { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_takes_last_printed_line() -> anyhow::Result<()> {
        let client = CommandRegistry::new("printf '1.0.0\\n  {package}-1.2.0  \\n\\n'");
        assert_eq!(client.latest("foo").await?, Some("foo-1.2.0".into()));

        let silent = CommandRegistry::new("true");
        assert_eq!(silent.latest("foo").await?, None);

        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_reports_failure() {
        let client = CommandRegistry::new("echo 'not found' >&2; exit 1");
        match client.latest("foo").await {
            Err(RegistryError::Command { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "not found");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn boxed_client_delegates() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/foo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dist-tags": { "latest": "1.0.0" }
            })))
            .mount(&server)
            .await;

        let client = from_settings(&RegistrySettings::Npm {
            url: server.uri(),
            timeout_secs: 2,
        })?;
        assert_eq!(client.latest("foo").await?, Some("1.0.0".into()));

        Ok(())
    }
}
