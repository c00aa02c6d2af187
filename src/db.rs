// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The workflow database: the collaborator that durably stores workflows,
//! jobs, transfers, and their dependencies.
//!
//! This module defines only the query/update surface the engine issues
//! against that storage, not a full durable storage service in its own
//! right. [`WorkflowDb`] is that query/update surface; [`SnapshotDb`] is
//! one concrete, in-process implementation: an in-memory snapshot, mutated
//! under a lock, persisted to a single `postcard`-serialized file after
//! every mutating call.

use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::job::{ExitInfo, Job, JobId, JobStatus};
use crate::transfer::{Transfer, TransferId, TransferStatus};
use crate::workflow::{NodeId, Workflow, WorkflowId, WorkflowStatus};
use crate::Error;

/// Name of the snapshot file under the resource's data directory.
pub const SNAPSHOT_FILE_NAME: &str = "db.postcard";

/// A job's edges in the full-dependency-closure: predecessors that must
/// reach a terminal-success status before it is launchable.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeEdges {
    pub predecessors: Vec<NodeId>,
    pub successors: Vec<NodeId>,
}

/// The durable contents of the workflow database.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Snapshot {
    pub workflows: HashMap<WorkflowId, Workflow>,
    pub jobs: HashMap<JobId, Job>,
    pub job_status: HashMap<JobId, JobStatus>,
    pub job_exit_info: HashMap<JobId, ExitInfo>,
    pub job_owner: HashMap<JobId, Option<WorkflowId>>,
    pub job_submitted_at: HashMap<JobId, u64>,
    pub transfers: HashMap<TransferId, Transfer>,
    pub edges: HashMap<NodeId, NodeEdges>,
}

/// The query/update surface the engine issues against the workflow
/// database.
///
/// Every method here corresponds to a concrete read or write the engine
/// needs to drive a workflow; there is no generic "store anything" escape
/// hatch.
pub trait WorkflowDb: Send + Sync {
    fn insert_workflow(&self, workflow: Workflow, edges: Vec<(NodeId, NodeId)>)
        -> Result<(), Error>;
    fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, Error>;
    fn set_workflow_status(&self, id: &WorkflowId, status: WorkflowStatus) -> Result<(), Error>;
    fn list_workflows(&self) -> Vec<WorkflowId>;

    fn insert_job(&self, job: Job, owner: Option<WorkflowId>) -> Result<(), Error>;
    fn get_job(&self, id: &JobId) -> Result<Job, Error>;
    fn job_owner(&self, id: &JobId) -> Result<Option<WorkflowId>, Error>;
    fn set_job_status(&self, id: &JobId, status: JobStatus) -> Result<(), Error>;
    fn get_job_status(&self, id: &JobId) -> Result<JobStatus, Error>;
    fn set_scheduler_id(&self, id: &JobId, scheduler_id: crate::job::SchedulerId)
        -> Result<(), Error>;
    fn record_exit_info(&self, id: &JobId, info: ExitInfo) -> Result<(), Error>;
    fn get_exit_info(&self, id: &JobId) -> Result<Option<ExitInfo>, Error>;
    fn set_submitted_at(&self, id: &JobId, unix_secs: u64) -> Result<(), Error>;
    fn get_submitted_at(&self, id: &JobId) -> Option<u64>;
    fn list_jobs(&self) -> Vec<JobId>;

    fn insert_transfer(&self, transfer: Transfer) -> Result<(), Error>;
    fn get_transfer(&self, id: &TransferId) -> Result<Transfer, Error>;
    fn set_transfer_status(&self, id: &TransferId, status: TransferStatus) -> Result<(), Error>;
    fn incref_transfer(&self, id: &TransferId) -> Result<(), Error>;
    fn decref_transfer(&self, id: &TransferId) -> Result<usize, Error>;
    fn remove_transfer(&self, id: &TransferId) -> Result<(), Error>;
    fn list_transfers(&self) -> Vec<TransferId>;

    /// Nodes whose predecessors (per the full-dependency-closure) are all
    /// terminal-success: a node is launchable iff every predecessor edge
    /// points at a job or transfer in a terminal success state.
    fn predecessors(&self, node: &NodeId) -> Vec<NodeId>;
    fn successors(&self, node: &NodeId) -> Vec<NodeId>;
}

/// An in-process [`WorkflowDb`] backed by a `postcard`-serialized snapshot
/// file: load the whole snapshot into memory on open, write the whole
/// thing back after every mutating call.
pub struct SnapshotDb {
    path: Option<PathBuf>,
    snapshot: Mutex<Snapshot>,
}

impl SnapshotDb {
    /// Construct an in-memory database with no backing file (used by tests
    /// and standalone submissions that do not need to survive a restart).
    pub fn in_memory() -> Self {
        SnapshotDb {
            path: None,
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    /// Construct a database backed by a snapshot file under `data_directory`,
    /// loading any existing snapshot.
    ///
    /// # Errors
    /// Returns [`Error::PostcardParse`] if an existing snapshot file is
    /// corrupt, or [`Error::FileRead`]/[`Error::DirectoryCreate`] on other
    /// I/O failure.
    pub fn open(data_directory: &Path) -> Result<Self, Error> {
        fs::create_dir_all(data_directory)
            .map_err(|e| Error::DirectoryCreate(data_directory.to_path_buf(), e))?;
        let path = data_directory.join(SNAPSHOT_FILE_NAME);

        let snapshot = match fs::read(&path) {
            Ok(bytes) => {
                debug!("Reading workflow database snapshot '{}'.", path.display());
                postcard::from_bytes(&bytes).map_err(|e| Error::PostcardParse(path.clone(), e))?
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                trace!("No snapshot at '{}', starting empty.", path.display());
                Snapshot::default()
            }
            Err(error) => return Err(Error::FileRead(path, error)),
        };

        Ok(SnapshotDb {
            path: Some(path),
            snapshot: Mutex::new(snapshot),
        })
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let bytes =
            postcard::to_allocvec(snapshot).map_err(|e| Error::PostcardSerialize(path.clone(), e))?;
        fs::write(path, bytes).map_err(|e| Error::FileWrite(path.clone(), e))
    }

    fn add_edge(snapshot: &mut Snapshot, from: NodeId, to: NodeId) {
        snapshot
            .edges
            .entry(from.clone())
            .or_default()
            .successors
            .push(to.clone());
        snapshot.edges.entry(to).or_default().predecessors.push(from);
    }
}

impl WorkflowDb for SnapshotDb {
    fn insert_workflow(
        &self,
        workflow: Workflow,
        edges: Vec<(NodeId, NodeId)>,
    ) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let id = workflow.id.clone();
        snapshot.workflows.insert(id, workflow);
        for (from, to) in edges {
            Self::add_edge(&mut snapshot, from, to);
        }
        self.persist(&snapshot)
    }

    fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, Error> {
        self.snapshot
            .lock()
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownWorkflow(id.clone()))
    }

    fn set_workflow_status(&self, id: &WorkflowId, status: WorkflowStatus) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let workflow = snapshot
            .workflows
            .get_mut(id)
            .ok_or_else(|| Error::UnknownWorkflow(id.clone()))?;
        workflow.status = status;
        self.persist(&snapshot)
    }

    fn list_workflows(&self) -> Vec<WorkflowId> {
        self.snapshot.lock().workflows.keys().cloned().collect()
    }

    fn insert_job(&self, job: Job, owner: Option<WorkflowId>) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let id = job.id.clone();
        snapshot.job_status.insert(id.clone(), JobStatus::NotSubmitted);
        snapshot.job_owner.insert(id.clone(), owner);
        snapshot.jobs.insert(id, job);
        self.persist(&snapshot)
    }

    fn get_job(&self, id: &JobId) -> Result<Job, Error> {
        self.snapshot
            .lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(id.clone()))
    }

    fn job_owner(&self, id: &JobId) -> Result<Option<WorkflowId>, Error> {
        self.snapshot
            .lock()
            .job_owner
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(id.clone()))
    }

    fn set_job_status(&self, id: &JobId, status: JobStatus) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        if !snapshot.jobs.contains_key(id) {
            return Err(Error::UnknownJob(id.clone()));
        }
        snapshot.job_status.insert(id.clone(), status);
        self.persist(&snapshot)
    }

    fn get_job_status(&self, id: &JobId) -> Result<JobStatus, Error> {
        self.snapshot
            .lock()
            .job_status
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownJob(id.clone()))
    }

    fn set_scheduler_id(
        &self,
        id: &JobId,
        scheduler_id: crate::job::SchedulerId,
    ) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let job = snapshot
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::UnknownJob(id.clone()))?;
        job.scheduler_id = Some(scheduler_id);
        self.persist(&snapshot)
    }

    fn record_exit_info(&self, id: &JobId, info: ExitInfo) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        if !snapshot.jobs.contains_key(id) {
            return Err(Error::UnknownJob(id.clone()));
        }
        snapshot.job_exit_info.insert(id.clone(), info);
        self.persist(&snapshot)
    }

    fn get_exit_info(&self, id: &JobId) -> Result<Option<ExitInfo>, Error> {
        let snapshot = self.snapshot.lock();
        if !snapshot.jobs.contains_key(id) {
            return Err(Error::UnknownJob(id.clone()));
        }
        Ok(snapshot.job_exit_info.get(id).copied())
    }

    fn set_submitted_at(&self, id: &JobId, unix_secs: u64) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        if !snapshot.jobs.contains_key(id) {
            return Err(Error::UnknownJob(id.clone()));
        }
        snapshot.job_submitted_at.insert(id.clone(), unix_secs);
        self.persist(&snapshot)
    }

    fn get_submitted_at(&self, id: &JobId) -> Option<u64> {
        self.snapshot.lock().job_submitted_at.get(id).copied()
    }

    fn list_jobs(&self) -> Vec<JobId> {
        self.snapshot.lock().jobs.keys().cloned().collect()
    }

    fn insert_transfer(&self, transfer: Transfer) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        snapshot.transfers.insert(transfer.local_path.clone(), transfer);
        self.persist(&snapshot)
    }

    fn get_transfer(&self, id: &TransferId) -> Result<Transfer, Error> {
        self.snapshot
            .lock()
            .transfers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))
    }

    fn set_transfer_status(&self, id: &TransferId, status: TransferStatus) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let transfer = snapshot
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))?;
        transfer.status = status;
        self.persist(&snapshot)
    }

    fn incref_transfer(&self, id: &TransferId) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let transfer = snapshot
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))?;
        transfer.refcount += 1;
        self.persist(&snapshot)
    }

    fn decref_transfer(&self, id: &TransferId) -> Result<usize, Error> {
        let mut snapshot = self.snapshot.lock();
        let transfer = snapshot
            .transfers
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))?;
        transfer.refcount = transfer.refcount.saturating_sub(1);
        let remaining = transfer.refcount;
        self.persist(&snapshot)?;
        Ok(remaining)
    }

    fn remove_transfer(&self, id: &TransferId) -> Result<(), Error> {
        let mut snapshot = self.snapshot.lock();
        let transfer = snapshot
            .transfers
            .get(id)
            .ok_or_else(|| Error::UnknownTransfer(id.clone()))?;
        if transfer.refcount > 0 {
            return Err(Error::TransferInUse(id.clone(), transfer.refcount));
        }
        snapshot.transfers.remove(id);
        self.persist(&snapshot)
    }

    fn list_transfers(&self) -> Vec<TransferId> {
        self.snapshot.lock().transfers.keys().cloned().collect()
    }

    fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        self.snapshot
            .lock()
            .edges
            .get(node)
            .map(|e| e.predecessors.clone())
            .unwrap_or_default()
    }

    fn successors(&self, node: &NodeId) -> Vec<NodeId> {
        self.snapshot
            .lock()
            .edges
            .get(node)
            .map(|e| e.successors.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    #[test]
    fn roundtrip_job_status() {
        let db = SnapshotDb::in_memory();
        let job = Job::new("j0".into(), vec!["/bin/true".into()]).unwrap();
        db.insert_job(job, None).unwrap();

        assert_eq!(db.get_job_status(&"j0".to_string()).unwrap(), JobStatus::NotSubmitted);
        db.set_job_status(&"j0".to_string(), JobStatus::Running).unwrap();
        assert_eq!(db.get_job_status(&"j0".to_string()).unwrap(), JobStatus::Running);
    }

    #[test]
    fn unknown_job_errors() {
        let db = SnapshotDb::in_memory();
        assert!(matches!(
            db.get_job(&"ghost".to_string()),
            Err(Error::UnknownJob(_))
        ));
    }

    #[test]
    fn transfer_refcount_blocks_removal() {
        let db = SnapshotDb::in_memory();
        let transfer = Transfer::new("t0".into(), PathBuf::from("/r"), 1, None);
        db.insert_transfer(transfer).unwrap();
        db.incref_transfer(&"t0".to_string()).unwrap();

        assert!(matches!(
            db.remove_transfer(&"t0".to_string()),
            Err(Error::TransferInUse(_, 1))
        ));

        assert_eq!(db.decref_transfer(&"t0".to_string()).unwrap(), 0);
        db.remove_transfer(&"t0".to_string()).unwrap();
    }

    #[test]
    fn persists_across_reopen() {
        let dir = assert_fs_tempdir();
        {
            let db = SnapshotDb::open(&dir).unwrap();
            let job = Job::new("j0".into(), vec!["/bin/true".into()]).unwrap();
            db.insert_job(job, None).unwrap();
        }
        let db = SnapshotDb::open(&dir).unwrap();
        assert!(db.get_job(&"j0".to_string()).is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }

    fn assert_fs_tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("weft-db-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
