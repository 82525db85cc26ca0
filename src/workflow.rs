// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Update detection and application.
//!
//! A single __run__ of the update workflow goes through the following steps:
//!
//! 1. Read the local version record and ask the registry for the latest
//!    version of the tracked package. Both lookups happen concurrently, and
//!    both must succeed.
//! 2. Without a local record, the latest version is recorded and nothing else
//!    happens. A fresh deployment has nothing to update yet.
//! 3. If the local record equals the latest version, nothing happens.
//! 4. Otherwise the update command runs in every target directory
//!    concurrently. Only once every single target succeeded is the new
//!    version recorded.
//!
//! # Version Record Invariant
//!
//! The version record always holds the last version that was fully applied
//! to every target directory. A failing target leaves the record at the old
//! version, so the next run retries all targets against the same new version.
//! Update commands must therefore be safe to run more than once.
//!
//! Runs must not overlap. The workflow holds no lock on the version record,
//! so whoever triggers runs is responsible for serializing them, which
//! [`Scheduler`](crate::schedule::Scheduler) does.

use crate::{
    action::{ActionError, ActionRunner, ShellActionRunner},
    config::{require, ConfigError, TargetDirectory, UpdaterConfig},
    registry::{self, RegistryClient, RegistryError},
    schedule::Job,
    store::{FileVersionStore, StoreError, VersionStore},
};

use async_trait::async_trait;
use futures::future::join_all;
use std::{
    error::Error as StdError,
    fmt::{Display, Formatter, Result as FmtResult},
};
use tracing::{error, info, instrument};

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// No version was recorded before, latest version is now recorded.
    Initialized { version: String },

    /// Recorded version is still the latest version.
    Unchanged { version: String },

    /// Update command was applied to all targets, new version is recorded.
    Updated {
        from: String,
        to: String,
        targets: usize,
    },
}

impl Display for RunOutcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Initialized { version } => write!(fmt, "initialized version record at {version}"),
            Self::Unchanged { version } => write!(fmt, "version {version} is up to date"),
            Self::Updated { from, to, targets } => {
                write!(fmt, "updated from {from} to {to} in {targets} target(s)")
            }
        }
    }
}

/// Local and remote version of tracked package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    /// Recorded version, [`None`] if nothing was recorded yet.
    pub local: Option<String>,

    /// Latest version published in registry.
    pub remote: String,
}

impl VersionCheck {
    /// Check if an update must be applied.
    pub fn is_pending(&self) -> bool {
        self.local
            .as_deref()
            .is_some_and(|local| local != self.remote)
    }
}

/// Update workflow for one tracked package.
pub struct UpdateWorkflow<S = FileVersionStore, R = Box<dyn RegistryClient>, A = ShellActionRunner>
where
    S: VersionStore,
    R: RegistryClient,
    A: ActionRunner,
{
    package_name: String,
    update_command: String,
    targets: Vec<TargetDirectory>,
    store: S,
    registry: R,
    runner: A,
}

impl UpdateWorkflow {
    /// Construct workflow with file store, shell runner, and configured
    /// registry.
    ///
    /// # Errors
    ///
    /// - Return [`SetupError::Config`] if a required field is missing.
    /// - Return [`SetupError::Registry`] if registry client cannot be
    ///   constructed.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self, SetupError> {
        let store = FileVersionStore::new(config.version_file_path());
        let registry = registry::from_settings(&config.registry)?;

        Ok(Self::try_new(
            config.package_name.as_str(),
            config.update_command.as_str(),
            config.target_directories.clone(),
            store,
            registry,
            ShellActionRunner::new(),
        )?)
    }
}

impl<S, R, A> UpdateWorkflow<S, R, A>
where
    S: VersionStore,
    R: RegistryClient,
    A: ActionRunner,
{
    /// Construct new workflow from its collaborators.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingField`] if update command or package
    ///   name is blank.
    pub fn try_new(
        package_name: impl Into<String>,
        update_command: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<TargetDirectory>>,
        store: S,
        registry: R,
        runner: A,
    ) -> Result<Self, ConfigError> {
        let package_name = package_name.into();
        let update_command = update_command.into();
        require("update_command", &update_command)?;
        require("package_name", &package_name)?;

        Ok(Self {
            package_name,
            update_command,
            targets: targets.into_iter().map(Into::into).collect(),
            store,
            registry,
            runner,
        })
    }

    /// Name of tracked package.
    pub fn package_name(&self) -> &str {
        self.package_name.as_str()
    }

    /// Compare recorded version against latest published version.
    ///
    /// Performs no side effects. An empty version record counts as no record.
    ///
    /// # Errors
    ///
    /// - Return [`WorkflowError::RemoteResolution`] if registry lookup fails
    ///   or names no version.
    /// - Return [`WorkflowError::LocalState`] if version record exists but
    ///   cannot be read.
    pub async fn check(&self) -> Result<VersionCheck> {
        let (local, remote) = tokio::join!(
            self.store.read(),
            self.registry.latest(&self.package_name)
        );

        let remote = match remote {
            Ok(Some(version)) if !version.is_empty() => version,
            Ok(_) => {
                return Err(WorkflowError::RemoteResolution {
                    package: self.package_name.clone(),
                    source: RegistryError::NoVersion(self.package_name.clone()),
                })
            }
            Err(source) => {
                return Err(WorkflowError::RemoteResolution {
                    package: self.package_name.clone(),
                    source,
                })
            }
        };

        let local = local
            .map_err(WorkflowError::LocalState)?
            .filter(|version| !version.is_empty());

        Ok(VersionCheck { local, remote })
    }

    /// Perform one run of the update workflow.
    ///
    /// Any error is logged before being returned to the caller.
    ///
    /// # Errors
    ///
    /// - Return [`WorkflowError::RemoteResolution`] if latest version cannot
    ///   be determined.
    /// - Return [`WorkflowError::LocalState`] if version record cannot be
    ///   read.
    /// - Return [`WorkflowError::ActionExecution`] if update command failed
    ///   for at least one target.
    /// - Return [`WorkflowError::Persistence`] if version record cannot be
    ///   written.
    #[instrument(skip(self), fields(package = %self.package_name))]
    pub async fn run(&self) -> Result<RunOutcome> {
        info!("-- start execute dependency updater --");

        let result = self.execute().await;
        match &result {
            Ok(outcome) => info!("{outcome}"),
            Err(err) => error!("error occurred while updating dependency: {}", report(err)),
        }

        info!("-- end execute dependency updater --");
        result
    }

    async fn execute(&self) -> Result<RunOutcome> {
        let VersionCheck { local, remote } = self.check().await?;

        let Some(local) = local else {
            info!("no local version known, record {remote} without updating");
            self.record(&remote).await?;
            return Ok(RunOutcome::Initialized { version: remote });
        };

        if local == remote {
            return Ok(RunOutcome::Unchanged { version: remote });
        }

        info!("version changed from {local} to {remote}");
        self.apply(&remote).await?;
        self.record(&remote).await?;

        Ok(RunOutcome::Updated {
            from: local,
            to: remote,
            targets: self.targets.len(),
        })
    }

    // INVARIANT: Every target runs to completion, even after a sibling failed.
    async fn apply(&self, version: &str) -> Result<()> {
        let runs = self
            .targets
            .iter()
            .map(|target| self.runner.run(target, &self.update_command));

        let failures = join_all(runs)
            .await
            .into_iter()
            .filter_map(|result| result.err())
            .collect::<Vec<_>>();

        if !failures.is_empty() {
            return Err(WorkflowError::ActionExecution {
                version: version.into(),
                attempted: self.targets.len(),
                failures,
            });
        }

        Ok(())
    }

    async fn record(&self, version: &str) -> Result<()> {
        self.store
            .write(version)
            .await
            .map_err(WorkflowError::Persistence)
    }
}

#[async_trait]
impl<S, R, A> Job for UpdateWorkflow<S, R, A>
where
    S: VersionStore,
    R: RegistryClient,
    A: ActionRunner,
{
    type Error = WorkflowError;

    async fn fire(&self) -> Result<()> {
        self.run().await.map(|_| ())
    }
}

/// Render error together with its chain of sources.
pub fn report(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

fn summarize(failures: &[ActionError]) -> String {
    failures
        .iter()
        .map(|failure| report(failure))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error types for a failed run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Version record exists but cannot be read.
    #[error("cannot read local version")]
    LocalState(#[source] StoreError),

    /// Latest version of package cannot be determined.
    #[error("latest version of {package:?} cannot be retrieved")]
    RemoteResolution {
        package: String,
        #[source]
        source: RegistryError,
    },

    /// Update command failed for at least one target.
    #[error(
        "update to {version} failed for {} of {attempted} target(s): {}",
        failures.len(),
        summarize(failures)
    )]
    ActionExecution {
        version: String,
        attempted: usize,
        failures: Vec<ActionError>,
    },

    /// Version record cannot be written after successful update.
    #[error("update applied but version record was not written")]
    Persistence(#[source] StoreError),
}

/// Error types for workflow construction.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry client cannot be constructed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Friendly result alias :3
type Result<T, E = WorkflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::render_command;
    use pretty_assertions::assert_eq;
    use std::{
        io::{Error as IoError, ErrorKind},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Read,
        Write(String),
        Run(String),
    }

    #[derive(Debug, Clone, Default)]
    struct Journal(Arc<Mutex<Vec<Event>>>);

    impl Journal {
        fn push(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }

        fn writes(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Write(version) => Some(version),
                    _ => None,
                })
                .collect()
        }

        fn runs(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    Event::Run(command) => Some(command),
                    _ => None,
                })
                .collect()
        }
    }

    struct MemoryStore {
        record: Mutex<Option<String>>,
        journal: Journal,
        broken_read: bool,
        broken_write: bool,
    }

    impl MemoryStore {
        fn new(record: Option<&str>, journal: &Journal) -> Self {
            Self {
                record: Mutex::new(record.map(Into::into)),
                journal: journal.clone(),
                broken_read: false,
                broken_write: false,
            }
        }

        fn current(&self) -> Option<String> {
            self.record.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VersionStore for MemoryStore {
        async fn read(&self) -> std::result::Result<Option<String>, StoreError> {
            self.journal.push(Event::Read);
            if self.broken_read {
                return Err(StoreError::Read {
                    path: PathBuf::from("temp/version.txt"),
                    source: IoError::from(ErrorKind::PermissionDenied),
                });
            }

            Ok(self.current())
        }

        async fn write(&self, version: &str) -> std::result::Result<(), StoreError> {
            self.journal.push(Event::Write(version.into()));
            if self.broken_write {
                return Err(StoreError::Write {
                    path: PathBuf::from("temp/version.txt"),
                    source: IoError::other("no space left on device"),
                });
            }

            *self.record.lock().unwrap() = Some(version.into());
            Ok(())
        }
    }

    struct FakeRegistry(Option<Option<String>>);

    impl FakeRegistry {
        fn answer(version: &str) -> Self {
            Self(Some(Some(version.into())))
        }

        fn unreachable() -> Self {
            Self(None)
        }
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn latest(&self, package: &str) -> std::result::Result<Option<String>, RegistryError> {
            self.0
                .clone()
                .ok_or_else(|| RegistryError::UnknownPackage(package.into()))
        }
    }

    struct FakeRunner {
        journal: Journal,
        failing: Vec<&'static str>,
    }

    impl FakeRunner {
        fn new(journal: &Journal) -> Self {
            Self {
                journal: journal.clone(),
                failing: Vec::new(),
            }
        }

        fn failing(journal: &Journal, failing: Vec<&'static str>) -> Self {
            Self {
                journal: journal.clone(),
                failing,
            }
        }
    }

    #[async_trait]
    impl ActionRunner for FakeRunner {
        async fn run(
            &self,
            target: &TargetDirectory,
            template: &str,
        ) -> std::result::Result<(), ActionError> {
            let command = render_command(template, target)?;
            self.journal.push(Event::Run(command.clone()));
            if self.failing.iter().any(|dir| target.as_path() == Path::new(dir)) {
                return Err(ActionError::Failed {
                    target: target.clone(),
                    command,
                    code: Some(1),
                    stderr: "boom".into(),
                });
            }

            Ok(())
        }
    }

    fn workflow<'a>(
        targets: impl IntoIterator<Item = &'a str>,
        store: MemoryStore,
        registry: FakeRegistry,
        runner: FakeRunner,
    ) -> UpdateWorkflow<MemoryStore, FakeRegistry, FakeRunner> {
        UpdateWorkflow::try_new("bse-admin", "build {app}", targets, store, registry, runner)
            .unwrap_or_else(|error| panic!("invalid workflow: {error}"))
    }

    #[tokio::test]
    async fn unchanged_version_runs_nothing_and_writes_nothing() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a", "/srv/apps/b"],
            MemoryStore::new(Some("0.0.1"), &journal),
            FakeRegistry::answer("0.0.1"),
            FakeRunner::new(&journal),
        );

        let outcome = flow.run().await?;

        assert_eq!(outcome, RunOutcome::Unchanged { version: "0.0.1".into() });
        assert_eq!(journal.events(), vec![Event::Read]);
        assert_eq!(flow.store.current(), Some("0.0.1".into()));

        Ok(())
    }

    #[tokio::test]
    async fn first_run_records_remote_without_running() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a"],
            MemoryStore::new(None, &journal),
            FakeRegistry::answer("1.2.3"),
            FakeRunner::new(&journal),
        );

        let outcome = flow.run().await?;

        assert_eq!(outcome, RunOutcome::Initialized { version: "1.2.3".into() });
        assert_eq!(journal.writes(), vec!["1.2.3".to_string()]);
        assert!(journal.runs().is_empty());
        assert_eq!(flow.store.current(), Some("1.2.3".into()));

        Ok(())
    }

    #[tokio::test]
    async fn empty_record_counts_as_first_run() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a"],
            MemoryStore::new(Some(""), &journal),
            FakeRegistry::answer("3.1.4"),
            FakeRunner::new(&journal),
        );

        assert_eq!(
            flow.run().await?,
            RunOutcome::Initialized { version: "3.1.4".into() }
        );
        assert!(journal.runs().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn update_runs_every_target_before_recording() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a", "/srv/apps/b"],
            MemoryStore::new(Some("1.0.0"), &journal),
            FakeRegistry::answer("2.0.0"),
            FakeRunner::new(&journal),
        );

        let outcome = flow.run().await?;

        assert_eq!(
            outcome,
            RunOutcome::Updated {
                from: "1.0.0".into(),
                to: "2.0.0".into(),
                targets: 2,
            }
        );
        assert_eq!(
            journal.events(),
            vec![
                Event::Read,
                Event::Run("build a".into()),
                Event::Run("build b".into()),
                Event::Write("2.0.0".into()),
            ]
        );
        assert_eq!(flow.store.current(), Some("2.0.0".into()));

        Ok(())
    }

    #[tokio::test]
    async fn failed_target_keeps_old_record() {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a", "/srv/apps/b"],
            MemoryStore::new(Some("1.0.0"), &journal),
            FakeRegistry::answer("2.0.0"),
            FakeRunner::failing(&journal, vec!["/srv/apps/b"]),
        );

        let result = flow.run().await;

        match result {
            Err(WorkflowError::ActionExecution {
                version,
                attempted,
                failures,
            }) => {
                assert_eq!(version, "2.0.0");
                assert_eq!(attempted, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].target(), &TargetDirectory::new("/srv/apps/b"));
            }
            other => panic!("expected action failure, got {other:?}"),
        }
        assert_eq!(journal.runs(), vec!["build a".to_string(), "build b".to_string()]);
        assert!(journal.writes().is_empty());
        assert_eq!(flow.store.current(), Some("1.0.0".into()));
    }

    #[tokio::test]
    async fn every_failed_target_is_reported() {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a", "/srv/apps/b", "/srv/apps/c"],
            MemoryStore::new(Some("1.0.0"), &journal),
            FakeRegistry::answer("2.0.0"),
            FakeRunner::failing(&journal, vec!["/srv/apps/a", "/srv/apps/c"]),
        );

        let error = flow.run().await.err();

        assert!(matches!(
            &error,
            Some(WorkflowError::ActionExecution { failures, .. }) if failures.len() == 2
        ));
        let message = error.map(|error| error.to_string()).unwrap_or_default();
        assert!(message.starts_with("update to 2.0.0 failed for 2 of 3 target(s)"));
        assert!(message.contains("/srv/apps/a"));
        assert!(message.contains("/srv/apps/c"));
        assert_eq!(journal.runs().len(), 3);
    }

    #[tokio::test]
    async fn empty_target_list_still_records_update() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            [],
            MemoryStore::new(Some("1.0.0"), &journal),
            FakeRegistry::answer("1.1.0"),
            FakeRunner::new(&journal),
        );

        assert_eq!(
            flow.run().await?,
            RunOutcome::Updated {
                from: "1.0.0".into(),
                to: "1.1.0".into(),
                targets: 0,
            }
        );
        assert!(journal.runs().is_empty());
        assert_eq!(flow.store.current(), Some("1.1.0".into()));

        Ok(())
    }

    #[tokio::test]
    async fn unreachable_registry_never_writes() {
        for local in [Some("1.0.0"), None] {
            let journal = Journal::default();
            let flow = workflow(
                ["/srv/apps/a"],
                MemoryStore::new(local, &journal),
                FakeRegistry::unreachable(),
                FakeRunner::new(&journal),
            );

            let result = flow.run().await;

            assert!(matches!(
                result,
                Err(WorkflowError::RemoteResolution {
                    source: RegistryError::UnknownPackage(_),
                    ..
                })
            ));
            assert!(journal.writes().is_empty());
            assert!(journal.runs().is_empty());
            assert_eq!(flow.store.current(), local.map(String::from));
        }
    }

    #[tokio::test]
    async fn blank_remote_version_is_resolution_failure() {
        for answer in [Some(String::new()), None] {
            let journal = Journal::default();
            let flow = workflow(
                ["/srv/apps/a"],
                MemoryStore::new(Some("1.0.0"), &journal),
                FakeRegistry(Some(answer)),
                FakeRunner::new(&journal),
            );

            assert!(matches!(
                flow.run().await,
                Err(WorkflowError::RemoteResolution {
                    source: RegistryError::NoVersion(_),
                    ..
                })
            ));
            assert!(journal.writes().is_empty());
        }
    }

    #[tokio::test]
    async fn unreadable_record_is_fatal() {
        let journal = Journal::default();
        let mut store = MemoryStore::new(Some("1.0.0"), &journal);
        store.broken_read = true;
        let flow = workflow(
            ["/srv/apps/a"],
            store,
            FakeRegistry::answer("2.0.0"),
            FakeRunner::new(&journal),
        );

        assert!(matches!(flow.run().await, Err(WorkflowError::LocalState(_))));
        assert!(journal.writes().is_empty());
        assert!(journal.runs().is_empty());
    }

    #[tokio::test]
    async fn failed_write_after_update_is_reported() {
        let journal = Journal::default();
        let mut store = MemoryStore::new(Some("1.0.0"), &journal);
        store.broken_write = true;
        let flow = workflow(
            ["/srv/apps/a"],
            store,
            FakeRegistry::answer("2.0.0"),
            FakeRunner::new(&journal),
        );

        assert!(matches!(flow.run().await, Err(WorkflowError::Persistence(_))));
        assert_eq!(journal.runs(), vec!["build a".to_string()]);
        assert_eq!(flow.store.current(), Some("1.0.0".into()));
    }

    #[tokio::test]
    async fn check_reports_pending_update_without_side_effects() -> anyhow::Result<()> {
        let journal = Journal::default();
        let flow = workflow(
            ["/srv/apps/a"],
            MemoryStore::new(Some("1.0.0"), &journal),
            FakeRegistry::answer("1.1.0"),
            FakeRunner::new(&journal),
        );

        let check = flow.check().await?;

        assert_eq!(
            check,
            VersionCheck {
                local: Some("1.0.0".into()),
                remote: "1.1.0".into(),
            }
        );
        assert!(check.is_pending());
        assert_eq!(journal.events(), vec![Event::Read]);

        Ok(())
    }

    #[test]
    fn construction_requires_command_and_package() {
        let journal = Journal::default();
        let result = UpdateWorkflow::try_new(
            "bse-admin",
            "",
            ["/srv/apps/a"],
            MemoryStore::new(None, &journal),
            FakeRegistry::answer("1.0.0"),
            FakeRunner::new(&journal),
        );
        assert!(matches!(result, Err(ConfigError::MissingField("update_command"))));

        let result = UpdateWorkflow::try_new(
            "",
            "build {app}",
            ["/srv/apps/a"],
            MemoryStore::new(None, &journal),
            FakeRegistry::answer("1.0.0"),
            FakeRunner::new(&journal),
        );
        assert!(matches!(result, Err(ConfigError::MissingField("package_name"))));
    }
}
