// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The distributed (message-passing) scheduler: a master
//! process hands work to N-1 slave processes via typed messages carried
//! over a [`Transport`] trait. The default [`ChannelTransport`] wires ranks
//! together with `std::sync::mpsc` within one process; a real inter-process
//! transport (sockets, or MPI itself) can implement the same trait without
//! touching master/slave logic.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::job::{ExitInfo, ExitStatus, Job, JobId, JobStatus, ResourceUsage, SchedulerId};
use crate::scheduler::local::Local;
use crate::scheduler::Scheduler;
use crate::Error;

/// Backoff a slave sleeps after receiving [`Message::NoJob`], preventing the
/// busy-wait called out in open questions.
const NO_JOB_BACKOFF: Duration = Duration::from_millis(200);

/// The distributed scheduler's tagged message set.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Message {
    /// slave -> master: "I can take work", payload is the slave's free CPU count.
    JobRequest { free_cpus: usize },
    /// master -> slave: a non-empty batch to run.
    JobSending(Vec<Job>),
    /// master -> slave: nothing pending, back off.
    NoJob,
    /// slave -> master: batch finished, mapping job id to an exit code (`None` => aborted).
    JobResult(HashMap<JobId, Option<i32>>),
    /// master -> slave: cancel a running job.
    JobKill(JobId),
    /// master -> slave, acked by the slave with the same tag: shut down.
    ExitSignal,
}

/// A bidirectional, rank-addressed typed channel carrying [`Message`]s.
///
/// Rank 0 is always the master; ranks `1..n` are slaves.
pub trait Transport: Send + Sync {
    /// Send `message` to `rank`.
    fn send(&self, rank: usize, message: Message) -> Result<(), Error>;

    /// Block until a message arrives from any rank, returning its source.
    fn recv_any(&self) -> Result<(usize, Message), Error>;

    /// Block until a message arrives from `rank` specifically.
    fn recv_from(&self, rank: usize) -> Result<Message, Error>;

    /// Non-blocking poll for a message from `rank`: `Ok(None)` if nothing is
    /// waiting yet.
    fn try_recv_from(&self, rank: usize) -> Result<Option<Message>, Error>;
}

/// An in-process [`Transport`] built from one `mpsc` channel per rank.
pub struct ChannelTransport {
    senders: Vec<Sender<(usize, Message)>>,
    receivers: Vec<Mutex<Receiver<(usize, Message)>>>,
    any_rx: Mutex<Receiver<(usize, Message)>>,
    any_tx: Sender<(usize, Message)>,
}

impl ChannelTransport {
    /// Build a fully connected transport for `n` ranks (1 master + n-1 slaves).
    pub fn new(n: usize) -> Arc<Self> {
        let mut senders = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for _ in 0..n {
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            receivers.push(Mutex::new(rx));
        }
        let (any_tx, any_rx) = mpsc::channel();

        Arc::new(ChannelTransport {
            senders,
            receivers,
            any_rx: Mutex::new(any_rx),
            any_tx,
        })
    }
}

impl Transport for ChannelTransport {
    fn send(&self, rank: usize, message: Message) -> Result<(), Error> {
        // Messages destined for the master (rank 0) are also delivered on the
        // "any source" channel so `recv_any` can observe them; slaves only
        // ever `recv_from` their own rank.
        if rank == 0 {
            self.any_tx
                .send((rank, message))
                .map_err(|_| Error::TransportClosed)
        } else {
            self.senders[rank]
                .send((rank, message))
                .map_err(|_| Error::TransportClosed)
        }
    }

    fn recv_any(&self) -> Result<(usize, Message), Error> {
        let guard = self.any_rx.lock().expect("lock poisoned");
        guard.recv().map_err(|_| Error::TransportClosed)
    }

    fn recv_from(&self, rank: usize) -> Result<Message, Error> {
        let guard = self.receivers[rank].lock().expect("lock poisoned");
        guard.recv().map(|(_, message)| message).map_err(|_| Error::TransportClosed)
    }

    fn try_recv_from(&self, rank: usize) -> Result<Option<Message>, Error> {
        let guard = self.receivers[rank].lock().expect("lock poisoned");
        match guard.try_recv() {
            Ok((_, message)) => Ok(Some(message)),
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => Err(Error::TransportClosed),
        }
    }
}

struct MasterState {
    queue: Vec<JobId>,
    jobs: HashMap<JobId, Job>,
    statuses: HashMap<JobId, JobStatus>,
    exit_info: HashMap<JobId, ExitInfo>,
    assigned_rank: HashMap<JobId, usize>,
    stopped_slaves: usize,
    shutdown: bool,
}

impl MasterState {
    fn new() -> Self {
        MasterState {
            queue: Vec::new(),
            jobs: HashMap::new(),
            statuses: HashMap::new(),
            exit_info: HashMap::new(),
            assigned_rank: HashMap::new(),
            stopped_slaves: 0,
            shutdown: false,
        }
    }

    /// Pop the highest-priority queued job, same ordering rule as
    /// the local scheduler.
    fn pop_highest_priority(&mut self) -> Option<JobId> {
        let mut best_index = None;
        for (index, id) in self.queue.iter().enumerate() {
            let priority = self.jobs[id].priority;
            let better = match best_index {
                None => true,
                Some(current_index) => {
                    let current_id = &self.queue[current_index];
                    priority > self.jobs[current_id].priority
                }
            };
            if better {
                best_index = Some(index);
            }
        }
        best_index.map(|index| self.queue.remove(index))
    }
}

/// The distributed scheduler: rank 0 runs the master loop below;
/// ranks `1..n` run [`slave_loop`].
pub struct Distributed {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<MasterState>>,
    n_ranks: usize,
    sleeping: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Distributed {
    /// Start a distributed scheduler with `n_slaves` slave ranks, each
    /// running jobs with `cpus_per_slave` local worker slots.
    pub fn new(n_slaves: usize, cpus_per_slave: usize) -> Arc<Self> {
        let n_ranks = n_slaves + 1;
        let transport = ChannelTransport::new(n_ranks);
        let state = Arc::new(Mutex::new(MasterState::new()));
        let sleeping = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(n_ranks);

        {
            let transport = Arc::clone(&transport);
            let state = Arc::clone(&state);
            let sleeping = Arc::clone(&sleeping);
            threads.push(
                thread::Builder::new()
                    .name("distributed-scheduler-master".into())
                    .spawn(move || master_loop(transport, state, n_slaves, sleeping))
                    .expect("failed to spawn master thread"),
            );
        }

        for rank in 1..n_ranks {
            let transport = Arc::clone(&transport);
            threads.push(
                thread::Builder::new()
                    .name(format!("distributed-scheduler-slave-{rank}"))
                    .spawn(move || slave_loop(rank, transport, cpus_per_slave))
                    .expect("failed to spawn slave thread"),
            );
        }

        Arc::new(Distributed {
            transport,
            state,
            n_ranks,
            sleeping,
            threads: Mutex::new(threads),
        })
    }

    /// Send `EXIT_SIGNAL` to every slave and wait for the master's shutdown
    /// acknowledgment.
    pub fn shutdown(&self) {
        for rank in 1..self.n_ranks {
            let _ = self.transport.send(rank, Message::ExitSignal);
        }

        let mut threads = self.threads.lock().expect("lock poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Run the master's single driver loop: probe unconditionally,
/// dispatch by tag, and terminate once every slave has acked `EXIT_SIGNAL`.
///
/// `sleeping` mirrors [`Scheduler::sleep`]/[`Scheduler::wake`] on the local
/// scheduler, but the master always keeps draining its inbox even while
/// asleep — sleeping only suppresses new dispatch ("no new processes may
/// be launched"), rather than halting the driver.
fn master_loop(
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<MasterState>>,
    n_slaves: usize,
    sleeping: Arc<AtomicBool>,
) {
    loop {
        let Ok((rank, message)) = transport.recv_any() else {
            return;
        };

        let mut guard = state.lock().expect("lock poisoned");

        match message {
            Message::JobRequest { .. } => {
                let dispatched = if sleeping.load(Ordering::Relaxed) {
                    None
                } else {
                    guard.pop_highest_priority()
                };

                if let Some(job_id) = dispatched {
                    let job = guard.jobs[&job_id].clone();
                    guard.statuses.insert(job_id.clone(), JobStatus::Running);
                    guard.assigned_rank.insert(job_id.clone(), rank);
                    drop(guard);
                    let _ = transport.send(rank, Message::JobSending(vec![job]));
                } else {
                    drop(guard);
                    let _ = transport.send(rank, Message::NoJob);
                }
            }
            Message::JobResult(results) => {
                for (job_id, value) in results {
                    match value {
                        Some(code) => {
                            guard.statuses.insert(job_id.clone(), JobStatus::Done);
                            guard.exit_info.insert(
                                job_id,
                                ExitInfo {
                                    exit_status: ExitStatus::FinishedRegularly,
                                    exit_value: Some(code),
                                    terminating_signal: None,
                                    resource_usage: ResourceUsage::default(),
                                },
                            );
                        }
                        None => {
                            guard.statuses.insert(job_id.clone(), JobStatus::Failed);
                            guard.exit_info.insert(
                                job_id,
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
            Message::ExitSignal => {
                guard.stopped_slaves += 1;
                trace!(
                    "Master received EXIT_SIGNAL ack ({}/{n_slaves}).",
                    guard.stopped_slaves
                );
                if guard.stopped_slaves == n_slaves {
                    guard.shutdown = true;
                    debug!("Master loop exiting after all slaves acked.");
                    return;
                }
            }
            Message::NoJob | Message::JobSending(_) | Message::JobKill(_) => {
                warn!("Master received a slave-bound tag; ignoring.");
            }
        }
    }
}

/// One slave's loop: ask for work, run what arrives via a
/// local-scheduler-of-one, and report results; back off on `NO_JOB` to
/// avoid busy-waiting.
fn slave_loop(rank: usize, transport: Arc<dyn Transport>, cpus: usize) {
    let local = Local::new(cpus);

    loop {
        let _ = transport.send(0, Message::JobRequest { free_cpus: cpus });

        let Ok(message) = transport.recv_from(rank) else {
            return;
        };

        match message {
            Message::JobSending(jobs) => {
                let mut scheduler_ids = HashMap::new();
                for job in &jobs {
                    if let Ok(id) = local.submit(job.clone()) {
                        scheduler_ids.insert(job.id.clone(), id);
                    }
                }

                let mut results = HashMap::new();
                for (job_id, scheduler_id) in scheduler_ids {
                    loop {
                        // A kill for this batch may arrive while we're
                        // waiting on any job in it; it names its target by
                        // job id, so other in-flight jobs in the batch are
                        // unaffected.
                        if let Ok(Some(Message::JobKill(target))) = transport.try_recv_from(rank) {
                            if target == job_id {
                                let _ = local.kill(scheduler_id);
                            }
                        }
                        match local.get_status(scheduler_id) {
                            Ok(status) if status.is_terminal() => break,
                            _ => thread::sleep(Duration::from_millis(20)),
                        }
                    }
                    let code = local
                        .get_exit_info(scheduler_id)
                        .ok()
                        .filter(|info| info.exit_status == ExitStatus::FinishedRegularly)
                        .and_then(|info| info.exit_value);
                    results.insert(job_id, code);
                }

                let _ = transport.send(0, Message::JobResult(results));
            }
            Message::NoJob => {
                thread::sleep(NO_JOB_BACKOFF);
            }
            Message::ExitSignal => {
                local.clean();
                let _ = transport.send(0, Message::ExitSignal);
                return;
            }
            Message::JobKill(_) => {
                // No batch in flight to apply this to; nothing to kill.
            }
            Message::JobRequest { .. } | Message::JobResult(_) => {
                warn!("Slave {rank} received a master-bound tag; ignoring.");
            }
        }
    }
}

impl Scheduler for Distributed {
    fn submit(&self, job: Job) -> Result<SchedulerId, Error> {
        if job.id.is_empty() {
            return Err(Error::InvalidJob);
        }

        let mut guard = self.state.lock().expect("lock poisoned");
        guard.statuses.insert(job.id.clone(), JobStatus::QueuedActive);
        guard.queue.push(job.id.clone());
        let hash = job_id_hash(&job.id);
        guard.jobs.insert(job.id.clone(), job);

        Ok(hash)
    }

    fn get_status(&self, id: SchedulerId) -> Result<JobStatus, Error> {
        let guard = self.state.lock().expect("lock poisoned");
        let job_id = guard
            .jobs
            .keys()
            .find(|k| job_id_hash(k) == id)
            .ok_or_else(|| Error::UnknownJob(id.to_string()))?;
        guard
            .statuses
            .get(job_id)
            .copied()
            .ok_or_else(|| Error::UnknownJob(id.to_string()))
    }

    fn get_exit_info(&self, id: SchedulerId) -> Result<ExitInfo, Error> {
        let mut guard = self.state.lock().expect("lock poisoned");
        let job_id = guard
            .jobs
            .keys()
            .find(|k| job_id_hash(k) == id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(id.to_string()))?;
        guard
            .exit_info
            .remove(&job_id)
            .ok_or_else(|| Error::UnknownJob(id.to_string()))
    }

    fn kill(&self, id: SchedulerId) -> Result<(), Error> {
        let mut guard = self.state.lock().expect("lock poisoned");
        let job_id = guard
            .jobs
            .keys()
            .find(|k| job_id_hash(k) == id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(id.to_string()))?;
        match guard.assigned_rank.get(&job_id).copied() {
            Some(rank) => {
                drop(guard);
                let _ = self.transport.send(rank, Message::JobKill(job_id));
            }
            None => {
                // Never dispatched: still sitting in the master's queue.
                // Remove it there rather than letting it be popped and run
                // to completion as though kill() had never been called.
                guard.queue.retain(|queued| queued != &job_id);
                guard.statuses.insert(job_id.clone(), JobStatus::Killed);
                guard.exit_info.insert(
                    job_id,
                    ExitInfo {
                        exit_status: ExitStatus::UserKilled,
                        exit_value: None,
                        terminating_signal: None,
                        resource_usage: ResourceUsage::default(),
                    },
                );
            }
        }
        Ok(())
    }

    fn sleep(&self) {
        self.sleeping.store(true, Ordering::Relaxed);
    }

    fn wake(&self) {
        self.sleeping.store(false, Ordering::Relaxed);
    }

    fn clean(&self) {
        self.shutdown();
    }
}

/// Hash a job id down to a `u64` scheduler id. Distinct job ids may
/// theoretically collide; `Distributed` accepts this in exchange for not
/// needing a second id allocator shared with [`crate::scheduler::local::Local`].
fn job_id_hash(id: &str) -> SchedulerId {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    #[test]
    fn many_jobs_across_slaves() {
        let distributed = Distributed::new(4, 1);

        let mut ids = Vec::new();
        for i in 0..20 {
            let job = Job::new(format!("job-{i}"), vec!["/bin/true".into()]).unwrap();
            ids.push(distributed.submit(job).unwrap());
        }

        for id in ids {
            assert!(wait_for(
                || matches!(distributed.get_status(id), Ok(s) if s.is_terminal()),
                Duration::from_secs(10)
            ));
        }

        distributed.shutdown();
    }

    #[test]
    fn shutdown_waits_for_all_acks() {
        let distributed = Distributed::new(3, 1);
        distributed.shutdown();
        // No panic / hang: the master loop only returns after 3 acks.
    }

    #[test]
    fn kill_removes_a_still_queued_job() {
        let distributed = Distributed::new(1, 1);

        // Occupy the only slave so the second job can never be dispatched
        // before we kill it.
        let busy = Job::new("busy".into(), vec!["/bin/sleep".into(), "30".into()]).unwrap();
        distributed.submit(busy).unwrap();

        let queued = Job::new("queued".into(), vec!["/bin/true".into()]).unwrap();
        let id = distributed.submit(queued).unwrap();

        // Give the slave a chance to claim the first job; the second must
        // still be sitting in the master's queue, unassigned.
        thread::sleep(Duration::from_millis(100));
        assert!(distributed
            .state
            .lock()
            .expect("lock poisoned")
            .assigned_rank
            .get(&"queued".to_string())
            .is_none());

        distributed.kill(id).unwrap();

        assert_eq!(distributed.get_status(id).unwrap(), JobStatus::Killed);
        let info = distributed.get_exit_info(id).unwrap();
        assert_eq!(info.exit_status, ExitStatus::UserKilled);

        distributed.shutdown();
    }

    #[test]
    fn kill_terminates_a_running_job() {
        let distributed = Distributed::new(1, 1);

        let job = Job::new("sleeper".into(), vec!["/bin/sleep".into(), "30".into()]).unwrap();
        let id = distributed.submit(job).unwrap();

        assert!(wait_for(
            || matches!(distributed.get_status(id), Ok(JobStatus::Running)),
            Duration::from_secs(5)
        ));

        distributed.kill(id).unwrap();

        assert!(wait_for(
            || matches!(distributed.get_status(id), Ok(s) if s.is_terminal()),
            Duration::from_secs(5)
        ));

        distributed.shutdown();
    }
}
