// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The job data model.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A client-visible job identifier, assigned on submission.
pub type JobId = String;

/// A scheduler-specific identifier, assigned once a job is started by a
/// [`crate::scheduler::Scheduler`].
pub type SchedulerId = u64;

/// A parallel job descriptor: a launcher configuration tag plus the maximum
/// number of nodes the job may span.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ParallelJobInfo {
    pub configuration_tag: String,
    pub max_node_count: u32,
}

/// A command plus its redirection, environment, and dependency metadata.
///
/// `Job` is a workflow node type. It carries no execution state;
/// state lives in the workflow database keyed by [`JobId`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,

    /// Non-empty ordered sequence of argument strings.
    pub command: Vec<String>,

    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub join_stderr_to_stdout: bool,

    pub working_directory: Option<PathBuf>,

    pub parallel_job_info: Option<ParallelJobInfo>,

    /// Disposal timeout, in hours.
    pub disposal_timeout_hours: u32,

    pub name: Option<String>,

    /// Higher priority jobs are submitted to the low-level scheduler first.
    pub priority: i64,

    pub input_transfers: Vec<crate::transfer::TransferId>,
    pub output_transfers: Vec<crate::transfer::TransferId>,

    /// Set once the job is dispatched to a low-level scheduler.
    pub scheduler_id: Option<SchedulerId>,
}

impl Job {
    /// Construct a new, unsubmitted job.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidJob`] when `command` is empty.
    pub fn new(id: JobId, command: Vec<String>) -> Result<Self, crate::Error> {
        if command.is_empty() {
            return Err(crate::Error::InvalidJob);
        }

        Ok(Job {
            id,
            command,
            stdin: None,
            stdout: None,
            stderr: None,
            join_stderr_to_stdout: false,
            working_directory: None,
            parallel_job_info: None,
            disposal_timeout_hours: 168,
            name: None,
            priority: 0,
            input_transfers: Vec::new(),
            output_transfers: Vec::new(),
            scheduler_id: None,
        })
    }
}

/// Job lifecycle status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum JobStatus {
    NotSubmitted,
    QueuedActive,
    Running,
    UserOnHold,
    UserSuspended,
    Done,
    Failed,
    Killed,
    Undetermined,
}

impl JobStatus {
    /// Terminal statuses per `{DONE, FAILED, KILLED}`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Killed)
    }

    /// Terminal-success, the precondition for a dependent node to launch.
    pub fn is_success(self) -> bool {
        matches!(self, JobStatus::Done)
    }
}

/// The way a job's process terminated.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ExitStatus {
    FinishedRegularly,
    UserKilled,
    ExitAborted,
    ExitNotRun,
    ExitUndetermined,
}

/// Resource usage accounting, carrying wall time since it is cheap to
/// measure and immediately useful for disposal-timeout accounting.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub wall_time_secs: u64,
}

/// `(exit_status, exit_value, terminating_signal, resource_usage)`.
/// `exit_value` is meaningful only when
/// `exit_status == FinishedRegularly`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExitInfo {
    pub exit_status: ExitStatus,
    pub exit_value: Option<i32>,
    pub terminating_signal: Option<i32>,
    pub resource_usage: ResourceUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_invalid() {
        assert!(matches!(
            Job::new("j0".into(), Vec::new()),
            Err(crate::Error::InvalidJob)
        ));
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new("j0".into(), vec!["/bin/echo".into(), "hi".into()]).unwrap();
        assert_eq!(job.priority, 0);
        assert!(job.scheduler_id.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Killed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::QueuedActive.is_terminal());
    }

    #[test]
    fn only_done_is_success() {
        assert!(JobStatus::Done.is_success());
        assert!(!JobStatus::Failed.is_success());
        assert!(!JobStatus::Killed.is_success());
    }
}
