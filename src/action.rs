// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Update command execution.
//!
//! When a new package version is detected, the configured __update command__
//! is run once in every target directory. The command is a template: each
//! occurrence of [`TARGET_PLACEHOLDER`] is replaced with the leaf name of the
//! target directory before the command is handed to the system shell. So,
//! `build {app}` for target directory `/srv/apps/foo` runs `build foo` with
//! `/srv/apps/foo` as its working directory.
//!
//! A template without the placeholder is run as-is, so it works for targets
//! with no leaf name such as `/` or `.`.
//!
//! Exit status zero means success, anything else is failure. Output of the
//! command is only ever logged. It is captured in full, but at most
//! [`MAX_LOGGED_OUTPUT`] bytes of each stream are logged or kept in
//! [`ActionError::Failed`]. No timeout is imposed, so a command that never
//! exits blocks the run that started it.

use crate::config::TargetDirectory;

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Token replaced by the target directory's leaf name.
pub const TARGET_PLACEHOLDER: &str = "{app}";

/// Byte limit of command output that is logged per stream.
pub const MAX_LOGGED_OUTPUT: usize = 1000 * 1024;

/// Substitute target directory name into command template.
///
/// # Errors
///
/// - Return [`ActionError::NoBasename`] if template uses the placeholder, but
///   target directory has no leaf name.
pub fn render_command(template: &str, target: &TargetDirectory) -> Result<String> {
    if !template.contains(TARGET_PLACEHOLDER) {
        return Ok(template.to_owned());
    }

    let name = target.basename().ok_or_else(|| ActionError::NoBasename {
        target: target.clone(),
    })?;

    Ok(template.replace(TARGET_PLACEHOLDER, &name))
}

/// Layer of indirection for running the update command.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run command template against target directory and wait for it.
    async fn run(&self, target: &TargetDirectory, template: &str) -> Result<()>;
}

/// Run update command through the system shell.
#[derive(Debug, Default, Clone)]
pub struct ShellActionRunner;

impl ShellActionRunner {
    /// Construct new shell runner.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionRunner for ShellActionRunner {
    /// Run rendered command in target directory.
    ///
    /// Standard output is logged at debug level, standard error at warn
    /// level. Neither affects the result.
    ///
    /// # Errors
    ///
    /// - Return [`ActionError::NoBasename`] if command cannot be rendered.
    /// - Return [`ActionError::Spawn`] if shell could not be started, e.g.,
    ///   target directory does not exist.
    /// - Return [`ActionError::Failed`] if command exits unsuccessfully.
    #[instrument(skip(self, template), level = "debug")]
    async fn run(&self, target: &TargetDirectory, template: &str) -> Result<()> {
        let command = render_command(template, target)?;
        info!("execute {command:?} in {:?}", target.as_path().display());

        let output = shell(&command)
            .current_dir(target.as_path())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ActionError::Spawn {
                target: target.clone(),
                command: command.clone(),
                source,
            })?;

        let stdout = capture(&output.stdout);
        let stderr = capture(&output.stderr);

        if !stdout.is_empty() {
            debug!("stdout: {stdout}");
        }

        if !stderr.is_empty() {
            warn!("stderr: {stderr}");
        }

        if !output.status.success() {
            return Err(ActionError::Failed {
                target: target.clone(),
                command,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(())
    }
}

/// Build shell invocation for command line.
pub(crate) fn shell(command: &str) -> Command {
    #[cfg(unix)]
    let mut shell = {
        let mut shell = Command::new("sh");
        shell.arg("-c");
        shell
    };

    #[cfg(windows)]
    let mut shell = {
        let mut shell = Command::new("cmd");
        shell.arg("/C");
        shell
    };

    shell.arg(command);
    shell
}

// INVARIANT: Chomp trailing newlines.
pub(crate) fn chomp(message: String) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

// INVARIANT: Cut at char boundary, never past MAX_LOGGED_OUTPUT bytes of text.
fn truncate(mut message: String) -> String {
    if message.len() <= MAX_LOGGED_OUTPUT {
        return message;
    }

    let mut end = MAX_LOGGED_OUTPUT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = message.len() - end;
    message.truncate(end);
    message.push_str(&format!("... ({dropped} more bytes)"));
    message
}

pub(crate) fn capture(bytes: &[u8]) -> String {
    truncate(chomp(String::from_utf8_lossy(bytes).into_owned()))
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "termination by signal".into(),
    }
}

/// All possible error types for update command execution.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Target directory has no leaf name to substitute.
    #[error("target directory {:?} has no name to substitute", target.as_path().display())]
    NoBasename { target: TargetDirectory },

    /// Shell could not be started.
    #[error("failed to start {command:?} in {:?}", target.as_path().display())]
    Spawn {
        target: TargetDirectory,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exited unsuccessfully.
    #[error(
        "command {command:?} failed in {:?} with {}",
        target.as_path().display(),
        describe_exit(code)
    )]
    Failed {
        target: TargetDirectory,
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl ActionError {
    /// Target directory the failure happened in.
    pub fn target(&self) -> &TargetDirectory {
        match self {
            Self::NoBasename { target } => target,
            Self::Spawn { target, .. } => target,
            Self::Failed { target, .. } => target,
        }
    }
}

/// Friendly result alias :3
type Result<T, E = ActionError> = std::result::Result<T, E>;
