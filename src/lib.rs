// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Scheduled dependency update checker.
//!
//! Depwatch tracks the published version of exactly one package. On every
//! scheduled run it compares the version it last applied against the latest
//! version in the registry. When the registry has moved on, the configured
//! update command runs in every target directory, and only once all of them
//! succeeded is the new version recorded locally.
//!
//! # See Also
//!
//! 1. [`UpdateWorkflow`]
//! 2. [`Scheduler`]
//! 3. [`UpdaterConfig`]

pub mod action;
pub mod config;
pub mod path;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod workflow;

pub use action::{ActionError, ActionRunner, ShellActionRunner};
pub use config::{ConfigError, RegistrySettings, ScheduleSettings, TargetDirectory, UpdaterConfig};
pub use registry::{CommandRegistry, NpmRegistry, RegistryClient, RegistryError};
pub use schedule::{Job, Scheduler};
pub use store::{FileVersionStore, StoreError, VersionStore};
pub use workflow::{RunOutcome, SetupError, UpdateWorkflow, VersionCheck, WorkflowError};
