// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The local scheduler: a fixed-width worker pool running jobs
//! as local subprocesses, spawned with `Command`, polled with `try_wait`,
//! and signaled on kill via `nix::sys::signal`.

use log::{debug, trace, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::job::{ExitInfo, ExitStatus, Job, JobStatus, ResourceUsage, SchedulerId};
use crate::scheduler::Scheduler;
use crate::Error;

struct Queued {
    priority: i64,
    sequence: u64,
    job: Job,
    scheduler_id: SchedulerId,
}

struct Running {
    child: Child,
    started_at: Instant,
}

struct State {
    queue: Vec<Queued>,
    sequence: u64,
    statuses: HashMap<SchedulerId, JobStatus>,
    running: HashMap<SchedulerId, Running>,
    terminated: HashMap<SchedulerId, ExitInfo>,
    kill_requested: std::collections::HashSet<SchedulerId>,
    shutdown: bool,
}

impl State {
    fn new() -> Self {
        State {
            queue: Vec::new(),
            sequence: 0,
            statuses: HashMap::new(),
            running: HashMap::new(),
            terminated: HashMap::new(),
            kill_requested: std::collections::HashSet::new(),
            shutdown: false,
        }
    }

    /// Pop the highest priority job, breaking ties by submission order.
    fn pop_ready(&mut self) -> Option<Queued> {
        let mut best_index = None;
        for (index, candidate) in self.queue.iter().enumerate() {
            let better = match best_index {
                None => true,
                Some(current) => {
                    let current: &Queued = &self.queue[current];
                    (candidate.priority, std::cmp::Reverse(candidate.sequence))
                        > (current.priority, std::cmp::Reverse(current.sequence))
                }
            };
            if better {
                best_index = Some(index);
            }
        }
        best_index.map(|index| self.queue.remove(index))
    }
}

/// `Local` runs jobs as local subprocesses within a fixed-width pool of
/// worker slots, typically the host's CPU count.
pub struct Local {
    slots: usize,
    state: Arc<Mutex<State>>,
    sleeping: Arc<AtomicBool>,
    next_id: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Local {
    /// Construct a new local scheduler with `slots` worker slots.
    pub fn new(slots: usize) -> Arc<Self> {
        let scheduler = Arc::new(Local {
            slots: slots.max(1),
            state: Arc::new(Mutex::new(State::new())),
            sleeping: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            driver: Mutex::new(None),
        });

        let driver_state = Arc::clone(&scheduler.state);
        let driver_sleeping = Arc::clone(&scheduler.sleeping);
        let driver_slots = scheduler.slots;
        let handle = thread::Builder::new()
            .name("local-scheduler-driver".into())
            .spawn(move || driver_loop(driver_state, driver_sleeping, driver_slots))
            .expect("failed to spawn local scheduler driver thread");

        *scheduler.driver.lock().expect("lock poisoned") = Some(handle);
        scheduler
    }
}

/// Start a process for `job`, redirecting stdio per its configuration.
fn spawn_job(job: &Job) -> Result<Child, Error> {
    let mut command = Command::new(&job.command[0]);
    command.args(&job.command[1..]);

    if let Some(dir) = &job.working_directory {
        command.current_dir(dir);
    }

    command.stdin(match &job.stdin {
        Some(path) => Stdio::from(
            File::open(path).map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))?,
        ),
        None => Stdio::null(),
    });

    let stdout_file = match &job.stdout {
        Some(path) => Some(
            File::create(path).map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))?,
        ),
        None => None,
    };

    command.stdout(match &stdout_file {
        Some(file) => Stdio::from(
            file.try_clone()
                .map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))?,
        ),
        None => Stdio::null(),
    });

    command.stderr(if job.join_stderr_to_stdout {
        match &stdout_file {
            Some(file) => Stdio::from(
                file.try_clone()
                    .map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))?,
            ),
            None => Stdio::null(),
        }
    } else {
        match &job.stderr {
            Some(path) => Stdio::from(
                File::create(path).map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))?,
            ),
            None => Stdio::null(),
        }
    });

    command
        .spawn()
        .map_err(|e| Error::SpawnProcess(job.command[0].clone(), e))
}

/// Map a completed `ExitStatus` to `weft`'s `ExitInfo` (nonzero
/// exit maps to FAILED with the code in `exit_value`; signal termination
/// maps to FAILED with the signal number in `terminating_signal`).
fn exit_info_from_status(status: std::process::ExitStatus, started_at: Instant) -> ExitInfo {
    let resource_usage = ResourceUsage {
        wall_time_secs: started_at.elapsed().as_secs(),
    };

    match status.signal() {
        Some(signal) => ExitInfo {
            exit_status: ExitStatus::UserKilled,
            exit_value: None,
            terminating_signal: Some(signal),
            resource_usage,
        },
        None => ExitInfo {
            exit_status: ExitStatus::FinishedRegularly,
            exit_value: status.code(),
            terminating_signal: None,
            resource_usage,
        },
    }
}

/// The scheduler's single driver loop: reap exited processes,
/// then fill free slots from the ready queue while the scheduler isn't
/// sleeping.
fn driver_loop(state: Arc<Mutex<State>>, sleeping: Arc<AtomicBool>, slots: usize) {
    loop {
        {
            let mut guard = state.lock().expect("lock poisoned");
            if guard.shutdown {
                return;
            }

            let mut exited = Vec::new();
            for (id, running) in &mut guard.running {
                if let Ok(Some(status)) = running.child.try_wait() {
                    exited.push((*id, exit_info_from_status(status, running.started_at)));
                }
            }

            for (id, info) in exited {
                trace!("Job {id} exited: {info:?}.");
                guard.running.remove(&id);
                guard.statuses.insert(
                    id,
                    if info.exit_status == ExitStatus::FinishedRegularly
                        && info.exit_value == Some(0)
                    {
                        JobStatus::Done
                    } else {
                        JobStatus::Failed
                    },
                );
                guard.terminated.insert(id, info);
            }

            if !sleeping.load(Ordering::Relaxed) {
                while guard.running.len() < slots {
                    let Some(queued) = guard.pop_ready() else {
                        break;
                    };

                    let should_kill = guard.kill_requested.remove(&queued.scheduler_id);
                    if should_kill {
                        guard.statuses.insert(queued.scheduler_id, JobStatus::Killed);
                        guard.terminated.insert(
                            queued.scheduler_id,
                            ExitInfo {
                                exit_status: ExitStatus::UserKilled,
                                exit_value: None,
                                terminating_signal: None,
                                resource_usage: ResourceUsage::default(),
                            },
                        );
                        continue;
                    }

                    match spawn_job(&queued.job) {
                        Ok(child) => {
                            debug!("Started job {} as pid {}.", queued.scheduler_id, child.id());
                            guard
                                .statuses
                                .insert(queued.scheduler_id, JobStatus::Running);
                            guard.running.insert(
                                queued.scheduler_id,
                                Running {
                                    child,
                                    started_at: Instant::now(),
                                },
                            );
                        }
                        Err(error) => {
                            warn!("Failed to start job {}: {error}.", queued.scheduler_id);
                            guard
                                .statuses
                                .insert(queued.scheduler_id, JobStatus::Failed);
                            guard.terminated.insert(
                                queued.scheduler_id,
                                ExitInfo {
                                    exit_status: ExitStatus::ExitAborted,
                                    exit_value: None,
                                    terminating_signal: None,
                                    resource_usage: ResourceUsage::default(),
                                },
                            );
                        }
                    }
                }
            }
        }

        thread::sleep(Duration::from_millis(20));
    }
}

impl Scheduler for Local {
    fn submit(&self, job: Job) -> Result<SchedulerId, Error> {
        if job.id.is_empty() {
            return Err(Error::InvalidJob);
        }

        let mut guard = self.state.lock().expect("lock poisoned");
        let scheduler_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let sequence = guard.sequence;
        guard.sequence += 1;

        guard.statuses.insert(scheduler_id, JobStatus::QueuedActive);
        guard.queue.push(Queued {
            priority: job.priority,
            sequence,
            job,
            scheduler_id,
        });

        Ok(scheduler_id)
    }

    fn get_status(&self, id: SchedulerId) -> Result<JobStatus, Error> {
        let guard = self.state.lock().expect("lock poisoned");
        guard
            .statuses
            .get(&id)
            .copied()
            .ok_or_else(|| Error::UnknownJob(id.to_string()))
    }

    fn get_exit_info(&self, id: SchedulerId) -> Result<ExitInfo, Error> {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard
            .terminated
            .remove(&id)
            .ok_or_else(|| Error::UnknownJob(id.to_string()))
    }

    fn kill(&self, id: SchedulerId) -> Result<(), Error> {
        let mut guard = self.state.lock().expect("lock poisoned");

        if let Some(running) = guard.running.get(&id) {
            let pid = Pid::from_raw(running.child.id() as i32);
            match signal::kill(pid, Signal::SIGTERM) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
                Err(e) => Err(Error::OS(e)),
            }
        } else if guard.queue.iter().any(|q| q.scheduler_id == id) {
            guard.kill_requested.insert(id);
            Ok(())
        } else if guard.statuses.contains_key(&id) {
            // Already terminal: kill is idempotent.
            Ok(())
        } else {
            Err(Error::UnknownJob(id.to_string()))
        }
    }

    fn sleep(&self) {
        self.sleeping.store(true, Ordering::Relaxed);
    }

    fn wake(&self) {
        self.sleeping.store(false, Ordering::Relaxed);
    }

    fn clean(&self) {
        let mut guard = self.state.lock().expect("lock poisoned");
        guard.shutdown = true;
        drop(guard);

        if let Some(handle) = self.driver.lock().expect("lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Local {
    fn drop(&mut self) {
        self.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::time::Duration as StdDuration;

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: StdDuration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(StdDuration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn single_job_success() {
        let scheduler = Local::new(2);
        let job = Job::new("j0".into(), vec!["/bin/echo".into(), "hello".into()]).unwrap();
        let id = scheduler.submit(job).unwrap();

        assert!(wait_for(
            || scheduler.get_status(id).unwrap().is_terminal(),
            StdDuration::from_secs(5)
        ));

        let info = scheduler.get_exit_info(id).unwrap();
        assert_eq!(info.exit_status, ExitStatus::FinishedRegularly);
        assert_eq!(info.exit_value, Some(0));

        // get_exit_info is single-shot: a second call fails.
        assert!(matches!(
            scheduler.get_exit_info(id),
            Err(Error::UnknownJob(_))
        ));
    }

    #[test]
    fn single_job_failure() {
        let scheduler = Local::new(2);
        let job = Job::new("j0".into(), vec!["/bin/false".into()]).unwrap();
        let id = scheduler.submit(job).unwrap();

        assert!(wait_for(
            || scheduler.get_status(id).unwrap().is_terminal(),
            StdDuration::from_secs(5)
        ));

        let info = scheduler.get_exit_info(id).unwrap();
        assert_eq!(info.exit_status, ExitStatus::FinishedRegularly);
        assert_eq!(info.exit_value, Some(1));
    }

    #[test]
    fn kill_running_job() {
        let scheduler = Local::new(2);
        let job = Job::new("j0".into(), vec!["/bin/sleep".into(), "60".into()]).unwrap();
        let id = scheduler.submit(job).unwrap();

        assert!(wait_for(
            || matches!(scheduler.get_status(id), Ok(JobStatus::Running)),
            StdDuration::from_secs(5)
        ));

        scheduler.kill(id).unwrap();
        // Idempotent.
        scheduler.kill(id).unwrap();

        assert!(wait_for(
            || scheduler.get_status(id).unwrap().is_terminal(),
            StdDuration::from_secs(5)
        ));

        let info = scheduler.get_exit_info(id).unwrap();
        assert!(info.terminating_signal.is_some());
    }

    #[test]
    fn priority_ordering() {
        let mut state = State::new();
        state.queue.push(Queued {
            priority: 1,
            sequence: 0,
            job: Job::new("low".into(), vec!["/bin/true".into()]).unwrap(),
            scheduler_id: 1,
        });
        state.queue.push(Queued {
            priority: 5,
            sequence: 1,
            job: Job::new("high".into(), vec!["/bin/true".into()]).unwrap(),
            scheduler_id: 2,
        });

        let popped = state.pop_ready().unwrap();
        assert_eq!(popped.scheduler_id, 2);
    }

    #[test]
    fn priority_ties_break_fifo() {
        let mut state = State::new();
        state.queue.push(Queued {
            priority: 1,
            sequence: 0,
            job: Job::new("first".into(), vec!["/bin/true".into()]).unwrap(),
            scheduler_id: 1,
        });
        state.queue.push(Queued {
            priority: 1,
            sequence: 1,
            job: Job::new("second".into(), vec!["/bin/true".into()]).unwrap(),
            scheduler_id: 2,
        });

        let popped = state.pop_ready().unwrap();
        assert_eq!(popped.scheduler_id, 1);
    }

    #[test]
    fn unknown_job_errors() {
        let scheduler = Local::new(1);
        assert!(matches!(
            scheduler.get_status(999),
            Err(Error::UnknownJob(_))
        ));
        assert!(matches!(scheduler.kill(999), Err(Error::UnknownJob(_))));
    }
}
