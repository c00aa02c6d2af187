// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The file transfer data model.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A transfer identifier. Allocated as a local path under the resource's
/// workspace; globally unique across concurrent submissions.
pub type TransferId = String;

/// Allocate a collision-free local path for a transfer under `root`.
///
/// A `uuid` v4 component makes the path unique without needing a central
/// counter consulted under lock, while the workflow database is still the
/// source of truth for the refcount.
pub fn allocate_local_path(root: &std::path::Path, remote_path: &std::path::Path) -> PathBuf {
    let name = remote_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "transfer".to_string());
    root.join(format!("{}-{name}", Uuid::new_v4()))
}

/// Transfer lifecycle status.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TransferStatus {
    TransferNotReady,
    ReadyToTransfer,
    Transferring,
    Transferred,
}

/// A mapping between a remote path (client host) and a local path (compute
/// resource), plus disposal bookkeeping.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Transfer {
    pub local_path: TransferId,
    pub remote_path: PathBuf,

    /// Disposal timeout, in hours.
    pub disposal_timeout_hours: u32,

    /// Unix timestamp (seconds) after which the transfer may be reclaimed
    /// if unreferenced.
    pub expires_at: u64,

    pub workflow_id: Option<crate::workflow::WorkflowId>,

    pub status: TransferStatus,

    /// Number of live jobs or workflows referencing this transfer.
    pub refcount: usize,
}

impl Transfer {
    pub fn new(
        local_path: TransferId,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
        workflow_id: Option<crate::workflow::WorkflowId>,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock after the epoch")
            .as_secs();

        Transfer {
            local_path,
            remote_path,
            disposal_timeout_hours,
            expires_at: now + u64::from(disposal_timeout_hours) * 3600,
            workflow_id,
            status: TransferStatus::ReadyToTransfer,
            refcount: 0,
        }
    }

    /// A transfer may be disposed only when nothing references it.
    pub fn disposable(&self) -> bool {
        self.refcount == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_local_path_is_unique() {
        let root = PathBuf::from("/resource/workspace");
        let remote = PathBuf::from("/home/user/input.txt");
        let a = allocate_local_path(&root, &remote);
        let b = allocate_local_path(&root, &remote);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("-input.txt"));
    }

    #[test]
    fn not_disposable_while_referenced() {
        let mut transfer = Transfer::new("t0".into(), PathBuf::from("/r"), 1, None);
        transfer.refcount = 1;
        assert!(!transfer.disposable());
        transfer.refcount = 0;
        assert!(transfer.disposable());
    }
}
