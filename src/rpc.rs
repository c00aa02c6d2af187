// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The engine RPC surface: the wire protocol between a client and the
//! engine host process, which exposes the workflow engine over this
//! remote-object-style proxy.
//!
//! Messages are length-prefixed `postcard` frames over a
//! [`std::net::TcpStream`]: a `u32` little-endian length followed by that
//! many bytes of `postcard`-encoded [`Request`]/[`Response`].

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::WorkflowSubmission;
use crate::job::{ExitInfo, JobId, JobStatus};
use crate::transfer::{TransferId, TransferStatus};
use crate::workflow::{Workflow, WorkflowId};
use crate::Error;

/// Every engine method exposed over the wire, as a single request enum so
/// the wire protocol has one frame shape in each direction.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Request {
    Submit(crate::job::Job),
    SubmitWorkflow {
        submission: WorkflowSubmission,
        disposal_timeout_hours: u32,
    },
    Dispose(String),
    Status(JobId),
    ExitInformation(JobId),
    JobInformation(JobId),
    StdoutReadline(JobId),
    StderrReadline(JobId),
    Wait {
        ids: Vec<JobId>,
        timeout_secs: Option<i64>,
    },
    Stop(JobId),
    Restart(JobId),
    Kill(JobId),
    RegisterTransfer {
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
    },
    SetTransferStatus {
        local_path: TransferId,
        status: TransferStatus,
    },
    TransferInformation(TransferId),
    CancelTransfer(TransferId),
    Jobs,
    Transfers,
    Workflows,
    /// A trivial engine call with no side effects, used by the connection
    /// layer's tunnel connectivity probe.
    Ping,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Response {
    Ack,
    JobId(JobId),
    Workflow(Box<Workflow>),
    MaybeStatus(Option<JobStatus>),
    MaybeExitInfo(Option<ExitInfo>),
    MaybeJobInformation(Option<(Option<String>, Vec<String>, u64)>),
    Line(String),
    Waited(bool),
    TransferId(TransferId),
    TransferInformation(TransferId, PathBuf, u64, Option<WorkflowId>),
    Ids(Vec<String>),
    Pong,
    Error(String),
}

/// Read exactly one length-prefixed `postcard` frame from `stream`.
///
/// # Errors
/// Returns [`Error::IO`] on a transport failure (a clean end-of-stream
/// surfaces as [`Error::TransportClosed`]) or [`Error::PostcardMessage`]
/// if the frame does not decode.
pub fn read_frame<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T, Error> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TransportClosed
        } else {
            Error::IO(e)
        }
    })?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).map_err(Error::IO)?;
    postcard::from_bytes(&buf).map_err(Error::PostcardMessage)
}

/// Write exactly one length-prefixed `postcard` frame to `stream`.
///
/// # Errors
/// Returns [`Error::PostcardMessage`] if `value` cannot be encoded or
/// [`Error::IO`] on a transport failure.
pub fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), Error> {
    let bytes = postcard::to_allocvec(value).map_err(Error::PostcardMessage)?;
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX).to_le_bytes();
    stream.write_all(&len).map_err(Error::IO)?;
    stream.write_all(&bytes).map_err(Error::IO)?;
    stream.flush().map_err(Error::IO)
}

/// A client-side proxy over the engine RPC surface: the connection
/// layer's end of the wire protocol.
pub struct EngineProxy {
    stream: TcpStream,
}

impl EngineProxy {
    /// Connect to an engine already listening at `addr`.
    ///
    /// # Errors
    /// Returns [`Error::IO`] if the connection cannot be established.
    pub fn connect(addr: impl std::net::ToSocketAddrs) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr).map_err(Error::IO)?;
        stream.set_nodelay(true).ok();
        Ok(EngineProxy { stream })
    }

    /// Wrap an already-connected stream, used once the connection layer
    /// has rewritten the address to the SSH tunnel's local port.
    pub fn from_stream(stream: TcpStream) -> Self {
        EngineProxy { stream }
    }

    fn call(&mut self, request: &Request) -> Result<Response, Error> {
        write_frame(&mut self.stream, request)?;
        read_frame(&mut self.stream)
    }

    /// A trivial engine call used by the connection layer's connectivity
    /// probe.
    pub fn ping(&mut self) -> Result<(), Error> {
        match self.call(&Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn submit(&mut self, job: crate::job::Job) -> Result<JobId, Error> {
        match self.call(&Request::Submit(job))? {
            Response::JobId(id) => Ok(id),
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    pub fn submit_workflow(
        &mut self,
        submission: WorkflowSubmission,
        disposal_timeout_hours: u32,
    ) -> Result<Workflow, Error> {
        match self.call(&Request::SubmitWorkflow {
            submission,
            disposal_timeout_hours,
        })? {
            Response::Workflow(workflow) => Ok(*workflow),
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    pub fn dispose(&mut self, id: &str) -> Result<(), Error> {
        self.ack(Request::Dispose(id.to_string()))
    }

    pub fn status(&mut self, job_id: &JobId) -> Result<Option<JobStatus>, Error> {
        match self.call(&Request::Status(job_id.clone()))? {
            Response::MaybeStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub fn exit_information(&mut self, job_id: &JobId) -> Result<Option<ExitInfo>, Error> {
        match self.call(&Request::ExitInformation(job_id.clone()))? {
            Response::MaybeExitInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub fn job_information(
        &mut self,
        job_id: &JobId,
    ) -> Result<Option<(Option<String>, Vec<String>, u64)>, Error> {
        match self.call(&Request::JobInformation(job_id.clone()))? {
            Response::MaybeJobInformation(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub fn stdout_readline(&mut self, job_id: &JobId) -> Result<String, Error> {
        match self.call(&Request::StdoutReadline(job_id.clone()))? {
            Response::Line(line) => Ok(line),
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    pub fn stderr_readline(&mut self, job_id: &JobId) -> Result<String, Error> {
        match self.call(&Request::StderrReadline(job_id.clone()))? {
            Response::Line(line) => Ok(line),
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Wait for every listed job to reach a terminal status.
    /// `timeout_secs` negative waits indefinitely, zero polls once,
    /// matching [`crate::engine::Engine::wait`].
    pub fn wait(&mut self, ids: &[JobId], timeout_secs: Option<i64>) -> Result<bool, Error> {
        match self.call(&Request::Wait {
            ids: ids.to_vec(),
            timeout_secs,
        })? {
            Response::Waited(all_terminal) => Ok(all_terminal),
            other => Err(unexpected(other)),
        }
    }

    pub fn stop(&mut self, job_id: &JobId) -> Result<(), Error> {
        self.ack(Request::Stop(job_id.clone()))
    }

    pub fn restart(&mut self, job_id: &JobId) -> Result<(), Error> {
        self.ack(Request::Restart(job_id.clone()))
    }

    pub fn kill(&mut self, job_id: &JobId) -> Result<(), Error> {
        self.ack(Request::Kill(job_id.clone()))
    }

    pub fn register_transfer(
        &mut self,
        remote_path: PathBuf,
        disposal_timeout_hours: u32,
    ) -> Result<TransferId, Error> {
        match self.call(&Request::RegisterTransfer {
            remote_path,
            disposal_timeout_hours,
        })? {
            Response::TransferId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_transfer_status(
        &mut self,
        local_path: TransferId,
        status: TransferStatus,
    ) -> Result<(), Error> {
        self.ack(Request::SetTransferStatus { local_path, status })
    }

    pub fn transfer_information(
        &mut self,
        local_path: &TransferId,
    ) -> Result<(TransferId, PathBuf, u64, Option<WorkflowId>), Error> {
        match self.call(&Request::TransferInformation(local_path.clone()))? {
            Response::TransferInformation(local, remote, expiry, workflow) => {
                Ok((local, remote, expiry, workflow))
            }
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    pub fn cancel_transfer(&mut self, local_path: &TransferId) -> Result<(), Error> {
        self.ack(Request::CancelTransfer(local_path.clone()))
    }

    pub fn jobs(&mut self) -> Result<Vec<JobId>, Error> {
        self.ids(Request::Jobs)
    }

    pub fn transfers(&mut self) -> Result<Vec<TransferId>, Error> {
        self.ids(Request::Transfers)
    }

    pub fn workflows(&mut self) -> Result<Vec<WorkflowId>, Error> {
        self.ids(Request::Workflows)
    }

    fn ids(&mut self, request: Request) -> Result<Vec<String>, Error> {
        match self.call(&request)? {
            Response::Ids(ids) => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    fn ack(&mut self, request: Request) -> Result<(), Error> {
        match self.call(&request)? {
            Response::Ack => Ok(()),
            Response::Error(message) => Err(Error::Connection(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Set the read timeout used by this proxy's calls. `None` blocks
    /// indefinitely, which is also the default: engine RPCs carry no
    /// implicit client timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.stream.set_read_timeout(timeout).map_err(Error::IO)
    }
}

fn unexpected(response: Response) -> Error {
    Error::Connection(format!("unexpected RPC response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn frame_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request: Request = read_frame(&mut stream).unwrap();
            assert!(matches!(request, Request::Ping));
            write_frame(&mut stream, &Response::Pong).unwrap();
        });

        let mut proxy = EngineProxy::connect(addr).unwrap();
        proxy.ping().unwrap();

        server.join().unwrap();
    }
}
