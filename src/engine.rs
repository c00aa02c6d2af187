// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The workflow engine / DAG driver: the component that turns
//! an accepted workflow into a stream of submissions to the low-level
//! scheduler, tracks per-node state, and drives each workflow to a
//! terminal status.

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::db::WorkflowDb;
use crate::job::{ExitInfo, ExitStatus, Job, JobId, JobStatus, SchedulerId};
use crate::scheduler::Scheduler;
use crate::transfer::{self, Transfer, TransferId, TransferStatus};
use crate::workflow::{NodeId, Workflow, WorkflowId, WorkflowStatus};
use crate::Error;

/// How often the driver thread ticks.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// How often the disposal sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock after the epoch")
        .as_secs()
}

/// A freshly accepted workflow, as returned by [`Engine::submit_workflow`]
/// once ids have been assigned and transfer local paths allocated.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct WorkflowSubmission {
    pub jobs: Vec<Job>,
    pub transfer_remote_paths: HashMap<TransferId, PathBuf>,
    pub dependencies: Vec<(NodeId, NodeId)>,
    pub groups: Vec<crate::workflow::Group>,
    pub disposal_timeout_hours: u32,
}

/// Per-job bookkeeping that is cheap to keep in memory and not worth the
/// durability of a [`WorkflowDb`] round-trip: stdout/stderr read cursors and
/// the job's live scheduler-id.
#[derive(Default)]
struct JobRuntime {
    scheduler_id: Option<SchedulerId>,
    stdout_offset: u64,
    stderr_offset: u64,
}

struct EngineState {
    runtime: HashMap<JobId, JobRuntime>,
    pending_cancel: HashSet<TransferId>,
}

/// The workflow engine.
///
/// Owns the low-level [`Scheduler`] and the [`WorkflowDb`], and runs a
/// driver thread that ticks every node of every non-terminal workflow plus
/// a disposal sweeper thread. `lock` is a single reentrant lock per engine
/// instance, guarding the tick/dispose/sweep critical sections while still
/// letting a single thread re-enter (e.g. dispose calling into tick's
/// helpers).
pub struct Engine {
    db: Arc<dyn WorkflowDb>,
    scheduler: Arc<dyn Scheduler>,
    workspace_root: PathBuf,
    state: Mutex<EngineState>,
    lock: ReentrantMutex<RefCell<()>>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Construct an engine and start its driver and sweeper threads.
    pub fn new(
        db: Arc<dyn WorkflowDb>,
        scheduler: Arc<dyn Scheduler>,
        workspace_root: PathBuf,
    ) -> Arc<Self> {
        let engine = Arc::new(Engine {
            db,
            scheduler,
            workspace_root,
            state: Mutex::new(EngineState {
                runtime: HashMap::new(),
                pending_cancel: HashSet::new(),
            }),
            lock: ReentrantMutex::new(RefCell::new(())),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        });

        let driver_engine = Arc::clone(&engine);
        let driver_handle = thread::Builder::new()
            .name("weft-engine-driver".into())
            .spawn(move || {
                while !driver_engine.shutdown.load(Ordering::Relaxed) {
                    driver_engine.tick_all();
                    thread::sleep(TICK_INTERVAL);
                }
            })
            .expect("failed to spawn engine driver thread");

        let sweep_engine = Arc::clone(&engine);
        let sweep_handle = thread::Builder::new()
            .name("weft-engine-sweeper".into())
            .spawn(move || {
                while !sweep_engine.shutdown.load(Ordering::Relaxed) {
                    sweep_engine.sweep();
                    thread::sleep(SWEEP_INTERVAL);
                }
            })
            .expect("failed to spawn engine sweeper thread");

        engine.threads.lock().push(driver_handle);
        engine.threads.lock().push(sweep_handle);

        engine
    }

    /// Shut down the driver and sweeper threads and release the scheduler.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.scheduler.clean();
    }

    // ---- submission --------------------------------------------------

    /// Submit a standalone job: no workflow, no dependencies, ready
    /// immediately.
    ///
    /// # Errors
    /// Returns [`Error::InvalidJob`] when the command is empty.
    pub fn submit(&self, mut job: Job) -> Result<JobId, Error> {
        if job.command.is_empty() {
            return Err(Error::InvalidJob);
        }
        if job.id.is_empty() {
            job.id = Uuid::new_v4().to_string();
        }
        let id = job.id.clone();
        self.db.insert_job(job, None)?;
        self.db.set_submitted_at(&id, now_unix())?;
        Ok(id)
    }

    /// Submit a workflow: assign ids, validate and
    /// compute the full-dependency-closure, allocate transfer local paths,
    /// persist through the workflow database, and set status to `Running`.
    ///
    /// # Errors
    /// Returns [`Error::CyclicWorkflow`] or [`Error::DanglingDependency`]
    /// when the declared dependencies are not a DAG over the closure.
    pub fn submit_workflow(&self, submission: WorkflowSubmission) -> Result<Workflow, Error> {
        let _guard = self.lock.lock();

        let workflow_id: WorkflowId = Uuid::new_v4().to_string();

        let mut job_transfers: HashMap<JobId, (Vec<TransferId>, Vec<TransferId>)> = HashMap::new();
        let mut transfer_ids = Vec::new();
        let mut allocated: HashMap<TransferId, Transfer> = HashMap::new();

        for (remote_path_id, remote_path) in &submission.transfer_remote_paths {
            let local_path = transfer::allocate_local_path(&self.workspace_root, remote_path)
                .to_string_lossy()
                .into_owned();
            let transfer = Transfer::new(
                local_path.clone(),
                remote_path.clone(),
                submission.disposal_timeout_hours,
                Some(workflow_id.clone()),
            );
            allocated.insert(remote_path_id.clone(), transfer);
            transfer_ids.push(local_path);
        }

        // `submission.jobs` already carries each job's input/output transfer
        // ids referencing the *logical* ids used as keys in
        // `transfer_remote_paths`; rewrite them to the allocated local paths.
        let mut jobs = submission.jobs;
        for job in &mut jobs {
            job.input_transfers = job
                .input_transfers
                .iter()
                .filter_map(|logical| allocated.get(logical).map(|t| t.local_path.clone()))
                .collect();
            job.output_transfers = job
                .output_transfers
                .iter()
                .filter_map(|logical| allocated.get(logical).map(|t| t.local_path.clone()))
                .collect();
            job_transfers.insert(
                job.id.clone(),
                (job.input_transfers.clone(), job.output_transfers.clone()),
            );
        }

        let job_ids: Vec<JobId> = jobs.iter().map(|j| j.id.clone()).collect();

        let mut workflow = Workflow::new(workflow_id.clone(), job_ids, transfer_ids);
        workflow.groups = submission.groups;
        workflow.dependencies = rewrite_dependencies(submission.dependencies, &allocated);

        let closure = workflow.full_dependency_closure(&job_transfers)?;

        for job in jobs {
            let id = job.id.clone();
            self.db.insert_job(job, Some(workflow_id.clone()))?;
            self.db.set_submitted_at(&id, now_unix())?;
        }

        for transfer in allocated.into_values() {
            let id = transfer.local_path.clone();
            self.db.insert_transfer(transfer)?;
            // One reference for the owning workflow, plus one per job that
            // lists it as an input or output: a transfer's refcount equals
            // the number of live jobs or workflows referencing it.
            self.db.incref_transfer(&id)?;
            let job_refs = job_transfers
                .values()
                .filter(|(inputs, outputs)| inputs.contains(&id) || outputs.contains(&id))
                .count();
            for _ in 0..job_refs {
                self.db.incref_transfer(&id)?;
            }
        }

        workflow.status = WorkflowStatus::InProgress;
        self.db.insert_workflow(workflow.clone(), closure)?;

        info!(
            "Submitted workflow '{workflow_id}' with {} job(s), {} transfer(s).",
            workflow.jobs.len(),
            workflow.transfers.len()
        );

        Ok(workflow)
    }

    // ---- driver tick ---------------------------------------------------

    /// Tick every non-terminal workflow plus any standalone (unowned) job.
    fn tick_all(&self) {
        let _guard = self.lock.lock();

        for workflow_id in self.db.list_workflows() {
            if let Ok(workflow) = self.db.get_workflow(&workflow_id) {
                if !workflow.status.is_terminal() {
                    self.tick_workflow(&workflow_id);
                }
            }
        }

        for job_id in self.db.list_jobs() {
            if self.db.job_owner(&job_id).ok().flatten().is_none() {
                self.tick_standalone_job(&job_id);
            }
        }
    }

    fn tick_standalone_job(&self, job_id: &JobId) {
        let Ok(status) = self.db.get_job_status(job_id) else {
            return;
        };
        match status {
            JobStatus::NotSubmitted => self.launch_job(job_id),
            JobStatus::QueuedActive | JobStatus::Running => self.poll_job(job_id),
            _ => {}
        }
    }

    /// Drive one workflow forward by exactly one level: ready
    /// transfers start transferring, ready jobs launch, in-flight jobs are
    /// polled, and failures propagate to unsubmitted descendants.
    fn tick_workflow(&self, workflow_id: &WorkflowId) {
        let Ok(workflow) = self.db.get_workflow(workflow_id) else {
            return;
        };

        for transfer_id in &workflow.transfers {
            self.tick_transfer(transfer_id);
        }

        let mut any_non_terminal = false;
        let mut any_failed = false;

        for job_id in &workflow.jobs {
            let Ok(status) = self.db.get_job_status(job_id) else {
                continue;
            };

            match status {
                JobStatus::NotSubmitted => {
                    if self.predecessors_successful(&NodeId::Job(job_id.clone())) {
                        self.launch_job(job_id);
                    }
                    any_non_terminal = true;
                }
                JobStatus::QueuedActive | JobStatus::Running => {
                    self.poll_job(job_id);
                    any_non_terminal = true;
                }
                JobStatus::UserOnHold | JobStatus::UserSuspended => {
                    any_non_terminal = true;
                }
                JobStatus::Failed | JobStatus::Killed => any_failed = true,
                JobStatus::Done | JobStatus::Undetermined => {}
            }
        }

        if any_failed {
            self.propagate_failure(&workflow);
        }

        if !any_non_terminal {
            let final_status = if any_failed {
                WorkflowStatus::Failed
            } else {
                WorkflowStatus::Done
            };
            if self.db.set_workflow_status(workflow_id, final_status).is_ok() {
                debug!("Workflow '{workflow_id}' reached terminal status {final_status:?}.");
            }
        }
    }

    /// Mark every strict descendant of a failed node that has not yet been
    /// submitted as permanently `NotSubmitted`-failed. Since `NotSubmitted` jobs whose predecessors never
    /// succeed are never launched, propagation here means flipping them
    /// straight to `Failed` so the workflow can reach a terminal status.
    fn propagate_failure(&self, workflow: &Workflow) {
        for job_id in &workflow.jobs {
            let Ok(status) = self.db.get_job_status(job_id) else {
                continue;
            };
            if status != JobStatus::NotSubmitted {
                continue;
            }
            let node = NodeId::Job(job_id.clone());
            let has_failed_predecessor = self.db.predecessors(&node).into_iter().any(|pred| {
                node_terminal_failed(&pred, self.db.as_ref())
            });
            if has_failed_predecessor {
                let _ = self.db.set_job_status(job_id, JobStatus::Failed);
                trace!("Job '{job_id}' marked FAILED: predecessor failed.");
            }
        }
    }

    fn predecessors_successful(&self, node: &NodeId) -> bool {
        self.db
            .predecessors(node)
            .into_iter()
            .all(|pred| node_terminal_success(&pred, self.db.as_ref()))
    }

    /// Submit a ready job to the low-level scheduler: submit it, record
    /// its scheduler-id, and move it to in-flight. Ready jobs are
    /// submitted in descending priority with ties broken by submission
    /// order — guaranteed by the low-level scheduler's own queue
    /// discipline, since every ready job observed in one tick is
    /// submitted to it in the same pass.
    fn launch_job(&self, job_id: &JobId) {
        let Ok(job) = self.db.get_job(job_id) else {
            return;
        };

        match self.scheduler.submit(job) {
            Ok(scheduler_id) => {
                let _ = self.db.set_scheduler_id(job_id, scheduler_id);
                let _ = self.db.set_job_status(job_id, JobStatus::QueuedActive);
                self.state
                    .lock()
                    .runtime
                    .entry(job_id.clone())
                    .or_default()
                    .scheduler_id = Some(scheduler_id);
                trace!("Launched job '{job_id}' as scheduler id {scheduler_id}.");
            }
            Err(error) => {
                warn!("Failed to submit job '{job_id}': {error}.");
            }
        }
    }

    /// Poll an in-flight job's status against the low-level scheduler; on
    /// terminal status, fetch exit info and finalize.
    fn poll_job(&self, job_id: &JobId) {
        let scheduler_id = {
            let state = self.state.lock();
            state.runtime.get(job_id).and_then(|r| r.scheduler_id)
        };
        let Some(scheduler_id) = scheduler_id else {
            return;
        };

        let Ok(status) = self.scheduler.get_status(scheduler_id) else {
            return;
        };

        if !status.is_terminal() {
            let _ = self.db.set_job_status(job_id, JobStatus::Running);
            return;
        }

        let Ok(info) = self.scheduler.get_exit_info(scheduler_id) else {
            return;
        };

        let final_status = if info.exit_status == ExitStatus::FinishedRegularly
            && info.exit_value == Some(0)
        {
            JobStatus::Done
        } else if info.exit_status == ExitStatus::UserKilled {
            JobStatus::Killed
        } else {
            JobStatus::Failed
        };

        let _ = self.db.record_exit_info(job_id, info);
        let _ = self.db.set_job_status(job_id, final_status);
        debug!("Job '{job_id}' reached terminal status {final_status:?}.");

        if let Ok(Some(owner)) = self.db.job_owner(job_id) {
            if final_status == JobStatus::Done {
                self.make_outputs_ready(&owner, job_id);
            }
        }
    }

    /// Output-transfer nodes become ready only after the producing job
    /// reaches `DONE`; they are surfaced as `READY_TO_TRANSFER` for
    /// retrieval.
    fn make_outputs_ready(&self, workflow_id: &WorkflowId, job_id: &JobId) {
        let Ok(job) = self.db.get_job(job_id) else {
            return;
        };
        for output in &job.output_transfers {
            if self.db.get_transfer(output).is_ok() {
                let _ = self.db.set_transfer_status(output, TransferStatus::ReadyToTransfer);
            }
        }
        let _ = workflow_id;
    }

    /// Signal the client-side collaborator to perform the physical transfer
    /// once a transfer node's predecessors are satisfied.
    ///
    /// Input transfers become ready as soon as they're registered (there is
    /// no predecessor to wait on from the engine's perspective — the client
    /// drives `READY_TO_TRANSFER -> TRANSFERRING -> TRANSFERRED` through
    /// [`crate::rpc`]'s `set_transfer_status`); this just treats a
    /// `TRANSFERRED` transfer as a successful node for readiness purposes.
    fn tick_transfer(&self, transfer_id: &TransferId) {
        // Readiness observation only; the actual status transitions are
        // driven by the client via `set_transfer_status`.
        let _ = self.db.get_transfer(transfer_id);
    }

    // ---- cancellation / control ----------------------------------------

    /// Dispose of a workflow or standalone job by id: kill every in-flight
    /// job, mark terminal, decrement transfer refcounts, and remove any
    /// transfer left with no remaining references.
    pub fn dispose(&self, id: &str) -> Result<(), Error> {
        let _guard = self.lock.lock();

        if let Ok(workflow) = self.db.get_workflow(&id.to_string()) {
            for job_id in &workflow.jobs {
                self.kill_job(job_id)?;
            }
            // Disposing the workflow releases every reference it and its
            // jobs hold on each transfer (one for the owning workflow, plus
            // one per job that lists it as an input/output — see
            // `submit_workflow`'s incref loop), not just one.
            for transfer_id in &workflow.transfers {
                loop {
                    match self.db.decref_transfer(transfer_id) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
                let _ = self.db.remove_transfer(transfer_id);
            }
            // Idempotent: a workflow that already reached a terminal status
            // (e.g. DONE) keeps it — dispose is cleanup, not an abort.
            if !workflow.status.is_terminal() {
                let _ = self.db.set_workflow_status(&id.to_string(), WorkflowStatus::Failed);
            }
            return Ok(());
        }

        if self.db.get_job(&id.to_string()).is_ok() {
            return self.kill_job(&id.to_string());
        }

        Err(Error::UnknownWorkflow(id.to_string()))
    }

    /// Request termination of a single job's scheduler-side process, if
    /// it has one; a no-op for a job that was never launched.
    pub fn kill_job(&self, job_id: &JobId) -> Result<(), Error> {
        let scheduler_id = self.state.lock().runtime.get(job_id).and_then(|r| r.scheduler_id);
        if let Some(scheduler_id) = scheduler_id {
            self.scheduler.kill(scheduler_id)?;
        }
        Ok(())
    }

    /// Hold a not-yet-submitted job, or suspend a running one by killing
    /// it — reaching `UserOnHold` or `UserSuspended` respectively.
    pub fn stop(&self, job_id: &JobId) -> Result<(), Error> {
        match self.db.get_job_status(job_id)? {
            JobStatus::NotSubmitted => self.db.set_job_status(job_id, JobStatus::UserOnHold),
            JobStatus::QueuedActive | JobStatus::Running => {
                self.kill_job(job_id)?;
                self.db.set_job_status(job_id, JobStatus::UserSuspended)
            }
            _ => Ok(()),
        }
    }

    /// Return a held or suspended job to `NotSubmitted` so the driver
    /// resubmits it on the next tick.
    pub fn restart(&self, job_id: &JobId) -> Result<(), Error> {
        match self.db.get_job_status(job_id)? {
            JobStatus::UserOnHold | JobStatus::UserSuspended => {
                self.db.set_job_status(job_id, JobStatus::NotSubmitted)
            }
            _ => Ok(()),
        }
    }

    /// `wait(ids, timeout)`: return on the earliest of (all listed
    /// jobs terminal) or (timeout elapsed). `timeout = None` waits
    /// indefinitely (the caller's negative-timeout case); `Some(Duration::ZERO)`
    /// polls once.
    pub fn wait(&self, job_ids: &[JobId], timeout: Option<Duration>) -> Result<bool, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let mut all_terminal = true;
            for job_id in job_ids {
                let status = self.db.get_job_status(job_id)?;
                if !status.is_terminal() {
                    all_terminal = false;
                    break;
                }
            }
            if all_terminal {
                return Ok(true);
            }
            if timeout == Some(Duration::ZERO) {
                return Ok(false);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(false);
                }
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    // ---- transfers -------------------------------------------------------

    /// `register_transfer(remote_path, disposal)`: allocate a
    /// collision-free local path for a standalone transfer.
    pub fn register_transfer(
        &self,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
    ) -> Result<TransferId, Error> {
        let local_path = transfer::allocate_local_path(&self.workspace_root, &remote_path)
            .to_string_lossy()
            .into_owned();
        let transfer = Transfer::new(local_path.clone(), remote_path, disposal_timeout_hours, None);
        self.db.insert_transfer(transfer)?;
        Ok(local_path)
    }

    pub fn set_transfer_status(&self, id: &TransferId, status: TransferStatus) -> Result<(), Error> {
        self.db.set_transfer_status(id, status)
    }

    /// Return a transfer's local path, remote path, expiry, and owning
    /// workflow id (if any), so a reconnecting client can recover enough
    /// context to know which workflow still references it.
    pub fn transfer_information(
        &self,
        id: &TransferId,
    ) -> Result<(TransferId, PathBuf, u64, Option<WorkflowId>), Error> {
        let transfer = self.db.get_transfer(id)?;
        Ok((
            transfer.local_path,
            transfer.remote_path,
            transfer.expires_at,
            transfer.workflow_id,
        ))
    }

    /// `cancel_transfer(local_path)`: deferred if refcount > 0.
    pub fn cancel_transfer(&self, id: &TransferId) -> Result<(), Error> {
        let transfer = self.db.get_transfer(id)?;
        if transfer.disposable() {
            self.db.remove_transfer(id)
        } else {
            self.state.lock().pending_cancel.insert(id.clone());
            Ok(())
        }
    }

    // ---- listings / introspection ---------------------------------------

    pub fn jobs(&self) -> Vec<JobId> {
        self.db.list_jobs()
    }

    pub fn transfers(&self) -> Vec<TransferId> {
        self.db.list_transfers()
    }

    pub fn workflows(&self) -> Vec<WorkflowId> {
        self.db.list_workflows()
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.db.get_job_status(job_id).ok()
    }

    pub fn exit_information(&self, job_id: &JobId) -> Option<ExitInfo> {
        self.db.get_exit_info(job_id).ok().flatten()
    }

    pub fn job_information(&self, job_id: &JobId) -> Option<(Option<String>, Vec<String>, u64)> {
        let job = self.db.get_job(job_id).ok()?;
        let submitted_at = self.db.get_submitted_at(job_id).unwrap_or(0);
        Some((job.name, job.command, submitted_at))
    }

    /// `stdout_readline(id)` / `stderr_readline(id)`: a single
    /// line from the job's redirected stream, advancing a per-job cursor.
    pub fn stdout_readline(&self, job_id: &JobId) -> Result<String, Error> {
        let job = self.db.get_job(job_id)?;
        let Some(path) = job.stdout else {
            return Ok(String::new());
        };
        self.readline(job_id, &path, true)
    }

    pub fn stderr_readline(&self, job_id: &JobId) -> Result<String, Error> {
        let job = self.db.get_job(job_id)?;
        let Some(path) = job.stderr else {
            return Ok(String::new());
        };
        self.readline(job_id, &path, false)
    }

    fn readline(&self, job_id: &JobId, path: &std::path::Path, is_stdout: bool) -> Result<String, Error> {
        let mut file = File::open(path).map_err(|e| Error::FileRead(path.to_path_buf(), e))?;

        let offset = {
            let state = self.state.lock();
            state.runtime.get(job_id).map_or(0, |r| {
                if is_stdout {
                    r.stdout_offset
                } else {
                    r.stderr_offset
                }
            })
        };

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::FileRead(path.to_path_buf(), e))?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::FileRead(path.to_path_buf(), e))?;

        let mut state = self.state.lock();
        let runtime = state.runtime.entry(job_id.clone()).or_default();
        if is_stdout {
            runtime.stdout_offset = offset + read as u64;
        } else {
            runtime.stderr_offset = offset + read as u64;
        }

        Ok(line)
    }

    // ---- disposal sweeper -------------------------------------------------

    /// Kill-and-dispose any job or transfer older than its deadline and not
    /// actively referenced.
    fn sweep(&self) {
        let _guard = self.lock.lock();
        let now = now_unix();

        for job_id in self.db.list_jobs() {
            let Ok(owner) = self.db.job_owner(&job_id) else {
                continue;
            };
            if owner.is_some() {
                continue; // swept via the owning workflow's disposal instead
            }
            let Ok(job) = self.db.get_job(&job_id) else {
                continue;
            };
            let Some(submitted_at) = self.db.get_submitted_at(&job_id) else {
                continue;
            };
            let deadline = submitted_at + u64::from(job.disposal_timeout_hours) * 3600;
            if now >= deadline {
                let _ = self.kill_job(&job_id);
                trace!("Swept expired standalone job '{job_id}'.");
            }
        }

        let pending: Vec<TransferId> = self.state.lock().pending_cancel.iter().cloned().collect();
        for transfer_id in pending {
            if let Ok(transfer) = self.db.get_transfer(&transfer_id) {
                if transfer.disposable() {
                    let _ = self.db.remove_transfer(&transfer_id);
                    self.state.lock().pending_cancel.remove(&transfer_id);
                }
            } else {
                self.state.lock().pending_cancel.remove(&transfer_id);
            }
        }

        for transfer_id in self.db.list_transfers() {
            if let Ok(transfer) = self.db.get_transfer(&transfer_id) {
                if transfer.disposable() && now >= transfer.expires_at {
                    let _ = self.db.remove_transfer(&transfer_id);
                    trace!("Swept expired transfer '{transfer_id}'.");
                }
            }
        }
    }
}

fn rewrite_dependencies(
    dependencies: Vec<(NodeId, NodeId)>,
    allocated: &HashMap<TransferId, Transfer>,
) -> Vec<(NodeId, NodeId)> {
    let rewrite = |node: NodeId| -> NodeId {
        match &node {
            NodeId::Transfer(logical) => allocated
                .get(logical)
                .map(|t| NodeId::Transfer(t.local_path.clone()))
                .unwrap_or(node),
            NodeId::Job(_) => node,
        }
    };
    dependencies
        .into_iter()
        .map(|(u, v)| (rewrite(u), rewrite(v)))
        .collect()
}

fn node_terminal_success(node: &NodeId, db: &dyn WorkflowDb) -> bool {
    match node {
        NodeId::Job(id) => db.get_job_status(id).map(|s| s.is_success()).unwrap_or(false),
        NodeId::Transfer(id) => db
            .get_transfer(id)
            .map(|t| t.status == TransferStatus::Transferred)
            .unwrap_or(false),
    }
}

fn node_terminal_failed(node: &NodeId, db: &dyn WorkflowDb) -> bool {
    match node {
        NodeId::Job(id) => matches!(
            db.get_job_status(id),
            Ok(JobStatus::Failed | JobStatus::Killed)
        ),
        NodeId::Transfer(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SnapshotDb;
    use crate::scheduler::local::Local;
    use std::time::Duration as StdDuration;

    fn wait_for<F: Fn() -> bool>(condition: F, timeout: StdDuration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(StdDuration::from_millis(20));
        }
        condition()
    }

    fn test_engine() -> Arc<Engine> {
        let db = Arc::new(SnapshotDb::in_memory());
        let scheduler = Local::new(4);
        Engine::new(db, scheduler, std::env::temp_dir())
    }

    #[test]
    fn standalone_job_runs_to_completion() {
        let engine = test_engine();
        let job = Job::new(String::new(), vec!["/bin/echo".into(), "hi".into()]).unwrap();
        let id = engine.submit(job).unwrap();

        assert!(wait_for(
            || matches!(engine.status(&id), Some(s) if s.is_terminal()),
            StdDuration::from_secs(5)
        ));
        assert_eq!(engine.status(&id), Some(JobStatus::Done));
        engine.shutdown();
    }

    #[test]
    fn dependency_chain_runs_in_order() {
        let engine = test_engine();

        let a = Job::new("a".into(), vec!["/bin/sleep".into(), "0".into()]).unwrap();
        let b = Job::new("b".into(), vec!["/bin/sleep".into(), "0".into()]).unwrap();
        let c = Job::new("c".into(), vec!["/bin/sleep".into(), "0".into()]).unwrap();

        let submission = WorkflowSubmission {
            jobs: vec![a, b, c],
            transfer_remote_paths: HashMap::new(),
            dependencies: vec![
                (NodeId::Job("a".into()), NodeId::Job("b".into())),
                (NodeId::Job("b".into()), NodeId::Job("c".into())),
            ],
            groups: Vec::new(),
            disposal_timeout_hours: 1,
        };

        let workflow = engine.submit_workflow(submission).unwrap();

        assert!(wait_for(
            || matches!(
                engine.db.get_workflow(&workflow.id),
                Ok(w) if w.status.is_terminal()
            ),
            StdDuration::from_secs(10)
        ));

        assert_eq!(
            engine.db.get_workflow(&workflow.id).unwrap().status,
            WorkflowStatus::Done
        );
        engine.shutdown();
    }

    #[test]
    fn failure_propagates_to_descendants() {
        let engine = test_engine();

        let a = Job::new("a".into(), vec!["/bin/false".into()]).unwrap();
        let b = Job::new("b".into(), vec!["/bin/true".into()]).unwrap();

        let submission = WorkflowSubmission {
            jobs: vec![a, b],
            transfer_remote_paths: HashMap::new(),
            dependencies: vec![(NodeId::Job("a".into()), NodeId::Job("b".into()))],
            groups: Vec::new(),
            disposal_timeout_hours: 1,
        };

        let workflow = engine.submit_workflow(submission).unwrap();

        assert!(wait_for(
            || matches!(
                engine.db.get_workflow(&workflow.id),
                Ok(w) if w.status.is_terminal()
            ),
            StdDuration::from_secs(10)
        ));

        assert_eq!(engine.status(&"b".to_string()), Some(JobStatus::Failed));
        assert_eq!(
            engine.db.get_workflow(&workflow.id).unwrap().status,
            WorkflowStatus::Failed
        );
        engine.shutdown();
    }

    #[test]
    fn dispose_is_idempotent() {
        let engine = test_engine();
        let job = Job::new(String::new(), vec!["/bin/sleep".into(), "5".into()]).unwrap();
        let id = engine.submit(job).unwrap();

        wait_for(
            || matches!(engine.status(&id), Some(JobStatus::Running)),
            StdDuration::from_secs(5),
        );

        engine.dispose(&id).unwrap();
        engine.dispose(&id).unwrap();
        engine.shutdown();
    }

    #[test]
    fn dispose_does_not_flip_a_done_workflow_to_failed() {
        let engine = test_engine();

        let a = Job::new("a".into(), vec!["/bin/true".into()]).unwrap();
        let submission = WorkflowSubmission {
            jobs: vec![a],
            transfer_remote_paths: HashMap::new(),
            dependencies: Vec::new(),
            groups: Vec::new(),
            disposal_timeout_hours: 1,
        };

        let workflow = engine.submit_workflow(submission).unwrap();

        assert!(wait_for(
            || matches!(
                engine.db.get_workflow(&workflow.id),
                Ok(w) if w.status.is_terminal()
            ),
            StdDuration::from_secs(10)
        ));
        assert_eq!(
            engine.db.get_workflow(&workflow.id).unwrap().status,
            WorkflowStatus::Done
        );

        engine.dispose(&workflow.id).unwrap();

        // dispose() is cleanup, not an abort: a workflow that already
        // reached DONE stays DONE.
        assert_eq!(
            engine.db.get_workflow(&workflow.id).unwrap().status,
            WorkflowStatus::Done
        );
        engine.shutdown();
    }

    #[test]
    fn dispose_clears_a_multiply_referenced_transfer() {
        let engine = test_engine();

        let mut remote_paths = HashMap::new();
        remote_paths.insert("t0".to_string(), PathBuf::from("/tmp/r_in.txt"));

        let mut a = Job::new("a".into(), vec!["/bin/true".into()]).unwrap();
        a.input_transfers = vec!["t0".into()];
        let mut b = Job::new("b".into(), vec!["/bin/true".into()]).unwrap();
        b.input_transfers = vec!["t0".into()];

        let submission = WorkflowSubmission {
            jobs: vec![a, b],
            transfer_remote_paths: remote_paths,
            dependencies: Vec::new(),
            groups: Vec::new(),
            disposal_timeout_hours: 1,
        };

        let workflow = engine.submit_workflow(submission).unwrap();
        let transfer_id = workflow.transfers[0].clone();

        // One reference for the owning workflow plus one per referencing job.
        assert_eq!(engine.db.get_transfer(&transfer_id).unwrap().refcount, 3);

        engine.dispose(&workflow.id).unwrap();

        assert!(engine.db.get_transfer(&transfer_id).is_err());
        engine.shutdown();
    }
}
