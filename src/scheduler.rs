// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The low-level scheduler interface and its implementations.

pub mod distributed;
pub mod local;

use crate::job::{ExitInfo, Job, JobStatus, SchedulerId};
use crate::Error;

/// Uniform contract under which jobs are actually run: submit, query
/// status, fetch exit info, kill, sleep/wake the internal driver, and clean
/// up on shutdown.
///
/// Implementations must be safe to call from multiple concurrent
/// requesters, so every method here takes `&self`.
pub trait Scheduler: Send + Sync {
    /// Submit `job` for execution.
    ///
    /// # Errors
    /// Returns [`Error::InvalidJob`] when `job.id` is empty.
    fn submit(&self, job: Job) -> Result<SchedulerId, Error>;

    /// Query the status of a previously submitted job.
    ///
    /// # Errors
    /// Returns [`Error::UnknownJob`] when `id` was never submitted.
    fn get_status(&self, id: SchedulerId) -> Result<JobStatus, Error>;

    /// Fetch and consume the exit info of a terminated job.
    ///
    /// Single-shot: calling this twice for the same `id` fails.
    ///
    /// # Errors
    /// Returns [`Error::UnknownJob`] when `id` was never submitted or its
    /// exit info was already consumed.
    fn get_exit_info(&self, id: SchedulerId) -> Result<ExitInfo, Error>;

    /// Request termination of a job. Idempotent.
    ///
    /// # Errors
    /// Returns [`Error::UnknownJob`] when `id` was never submitted.
    fn kill(&self, id: SchedulerId) -> Result<(), Error>;

    /// Pause the scheduler's internal driver. While sleeping, no new
    /// processes may be launched.
    fn sleep(&self);

    /// Resume the scheduler's internal driver.
    fn wake(&self);

    /// Release resources on shutdown.
    fn clean(&self);
}
