// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Periodic run triggering.
//!
//! The [`Scheduler`] fires a [`Job`] on a fixed interval until told to shut
//! down. Each run is awaited before the next tick is considered, and ticks
//! missed while a run was still going are skipped, so two runs never overlap.
//! A failed run reports its own error, the scheduler only notes the retry at
//! the next interval.

use crate::config::{ConfigError, ScheduleSettings};

use async_trait::async_trait;
use std::{error::Error as StdError, future::Future, time::Duration};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Longest interval a scheduler accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Unit of work the scheduler can fire.
#[async_trait]
pub trait Job: Send + Sync {
    /// Error type of a failed run.
    type Error: StdError + Send + Sync + 'static;

    /// Perform one run.
    async fn fire(&self) -> Result<(), Self::Error>;
}

/// Fire job on fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    interval: Duration,
    run_on_start: bool,
}

impl Scheduler {
    /// Construct new scheduler.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidInterval`] if interval is zero or longer
    ///   than [`MAX_INTERVAL`].
    pub fn new(interval: Duration, run_on_start: bool) -> Result<Self, ConfigError> {
        if interval.is_zero() || interval > MAX_INTERVAL {
            return Err(ConfigError::InvalidInterval);
        }

        Ok(Self {
            interval,
            run_on_start,
        })
    }

    /// Construct new scheduler from configuration settings.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidInterval`] if interval is zero or longer
    ///   than [`MAX_INTERVAL`].
    pub fn from_settings(settings: &ScheduleSettings) -> Result<Self, ConfigError> {
        Self::new(
            Duration::from_secs(settings.interval_secs),
            settings.run_on_start,
        )
    }

    /// Fire job on every tick until shutdown resolves.
    ///
    /// A run in progress is never interrupted. Shutdown is only observed
    /// between runs. Returns the number of runs performed, failed runs
    /// included.
    pub async fn run_until<J>(&self, job: &J, shutdown: impl Future<Output = ()>) -> usize
    where
        J: Job,
    {
        let start = if self.run_on_start {
            Instant::now()
        } else {
            Instant::now() + self.interval
        };
        let mut ticker = interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("check every {}s", self.interval.as_secs());
        let mut runs = 0;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested, stop scheduling");
                    break;
                }
                _ = ticker.tick() => {
                    if job.fire().await.is_err() {
                        warn!("scheduled run failed, retry at next interval");
                    }
                    runs += 1;
                }
            }
        }

        runs
    }
}
