// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The engine host process: the long-lived
//! server that exposes [`crate::engine::Engine`] over the RPC surface and
//! runs the connection-checker heartbeat receiver the client's
//! [`crate::connection`] layer talks to.

use log::{debug, info, trace, warn};
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::rpc::{self, Request, Response};
use crate::{Error, DEFAULT_CONTROL_INTERVAL_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS};

/// The connection-checker: tracks the client's last heartbeat
/// signal and calls a disconnection callback once it goes stale.
struct ConnectionChecker {
    last_signal: Mutex<Instant>,
    connected: AtomicBool,
}

impl ConnectionChecker {
    fn new() -> Arc<Self> {
        Arc::new(ConnectionChecker {
            last_signal: Mutex::new(Instant::now()),
            connected: AtomicBool::new(true),
        })
    }

    fn signal(&self) {
        *self.last_signal.lock().expect("lock poisoned") = Instant::now();
    }

    /// "connected iff now - last-signal <= 3 x interval".
    fn is_stale(&self) -> bool {
        let last = *self.last_signal.lock().expect("lock poisoned");
        last.elapsed() > Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS * 3)
    }
}

/// Run the engine host process to completion: print the two-line banner, serve the RPC surface and the
/// heartbeat receiver, and shut down cleanly once the client disconnects.
///
/// # Errors
/// Returns [`Error::IO`] if either listener cannot be bound.
pub fn run(engine: Arc<Engine>, login: &str) -> Result<(), Error> {
    let rpc_listener = TcpListener::bind(("127.0.0.1", 0)).map_err(Error::IO)?;
    let heartbeat_listener = TcpListener::bind(("127.0.0.1", 0)).map_err(Error::IO)?;
    rpc_listener.set_nonblocking(true).map_err(Error::IO)?;
    heartbeat_listener.set_nonblocking(true).map_err(Error::IO)?;

    let rpc_port = rpc_listener.local_addr().map_err(Error::IO)?.port();
    let heartbeat_port = heartbeat_listener.local_addr().map_err(Error::IO)?.port();

    // The engine host writes exactly two non-error lines to its standard
    // output, each of the form `<label> <uri>`. Extra log lines
    // before/between are permitted but ignored by the reader in
    // `crate::connection`; nothing else is written to stdout here.
    println!("workflow_engine_{login} tcp://127.0.0.1:{rpc_port}");
    println!("connection_checker tcp://127.0.0.1:{heartbeat_port}");

    let checker = ConnectionChecker::new();
    let shutdown = Arc::new(AtomicBool::new(false));

    let control_thread = {
        let checker = Arc::clone(&checker);
        let shutdown = Arc::clone(&shutdown);
        let engine = Arc::clone(&engine);
        thread::Builder::new()
            .name("weft-connection-control".into())
            .spawn(move || control_loop(&checker, &shutdown, &engine))
            .map_err(Error::IO)?
    };

    let heartbeat_thread = {
        let checker = Arc::clone(&checker);
        let shutdown = Arc::clone(&shutdown);
        thread::Builder::new()
            .name("weft-heartbeat-receiver".into())
            .spawn(move || heartbeat_accept_loop(heartbeat_listener, &checker, &shutdown))
            .map_err(Error::IO)?
    };

    rpc_accept_loop(rpc_listener, &engine, &shutdown);

    let _ = heartbeat_thread.join();
    let _ = control_thread.join();
    engine.shutdown();

    info!("Engine host process shutting down.");
    Ok(())
}

/// Disconnection detection: poll staleness every
/// `DEFAULT_CONTROL_INTERVAL_SECS`; the transition to disconnected invokes
/// the disconnection callback, which here is simply requesting shutdown.
fn control_loop(checker: &ConnectionChecker, shutdown: &AtomicBool, _engine: &Engine) {
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(DEFAULT_CONTROL_INTERVAL_SECS));
        if checker.is_stale() {
            if checker.connected.swap(false, Ordering::Relaxed) {
                warn!("Client heartbeat went stale; shutting the engine down.");
                shutdown.store(true, Ordering::Relaxed);
            }
        } else {
            checker.connected.store(true, Ordering::Relaxed);
        }
    }
}

/// Accept heartbeat connections; each byte read from a connection counts as
/// a signal ("a last-signal timestamp updated by the client's
/// heartbeat thread every interval seconds").
fn heartbeat_accept_loop(listener: TcpListener, checker: &Arc<ConnectionChecker>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let checker = Arc::clone(checker);
                thread::spawn(move || drain_heartbeat(stream, &checker));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("Heartbeat listener accept failed: {e}.");
                break;
            }
        }
    }
}

fn drain_heartbeat(mut stream: TcpStream, checker: &ConnectionChecker) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => checker.signal(),
            Err(_) => break,
        }
    }
}

/// Accept RPC connections and serve requests. One thread per
/// connection; the [`Engine`] itself serializes concurrent access via its
/// own reentrant lock.
fn rpc_accept_loop(listener: TcpListener, engine: &Arc<Engine>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!("RPC connection from {peer}.");
                let engine = Arc::clone(engine);
                thread::spawn(move || serve_connection(stream, &engine));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("RPC listener accept failed: {e}.");
                break;
            }
        }
    }
}

fn serve_connection(mut stream: TcpStream, engine: &Engine) {
    loop {
        let request: Request = match rpc::read_frame(&mut stream) {
            Ok(request) => request,
            Err(Error::TransportClosed) => break,
            Err(e) => {
                debug!("RPC connection read failed: {e}.");
                break;
            }
        };

        let response = handle_request(engine, request);
        if rpc::write_frame(&mut stream, &response).is_err() {
            break;
        }
    }
}

/// Dispatch one [`Request`] to the [`Engine`].
fn handle_request(engine: &Engine, request: Request) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Submit(job) => match engine.submit(job) {
            Ok(id) => Response::JobId(id),
            Err(e) => Response::Error(e.to_string()),
        },

        Request::SubmitWorkflow {
            mut submission,
            disposal_timeout_hours,
        } => {
            submission.disposal_timeout_hours = disposal_timeout_hours;
            match engine.submit_workflow(submission) {
                Ok(workflow) => Response::Workflow(Box::new(workflow)),
                Err(e) => Response::Error(e.to_string()),
            }
        }

        Request::Dispose(id) => match engine.dispose(&id) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },

        Request::Status(id) => Response::MaybeStatus(engine.status(&id)),
        Request::ExitInformation(id) => Response::MaybeExitInfo(engine.exit_information(&id)),
        Request::JobInformation(id) => Response::MaybeJobInformation(engine.job_information(&id)),

        Request::StdoutReadline(id) => match engine.stdout_readline(&id) {
            Ok(line) => Response::Line(line),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StderrReadline(id) => match engine.stderr_readline(&id) {
            Ok(line) => Response::Line(line),
            Err(e) => Response::Error(e.to_string()),
        },

        Request::Wait { ids, timeout_secs } => {
            let timeout = match timeout_secs {
                None => None,
                Some(secs) if secs < 0 => None,
                Some(secs) => Some(Duration::from_secs(secs as u64)),
            };
            match engine.wait(&ids, timeout) {
                Ok(all_terminal) => Response::Waited(all_terminal),
                Err(_) => Response::Waited(false),
            }
        }

        Request::Stop(id) => match engine.stop(&id) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Restart(id) => match engine.restart(&id) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Kill(id) => match engine.kill_job(&id) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },

        Request::RegisterTransfer {
            remote_path,
            disposal_timeout_hours,
        } => match engine.register_transfer(remote_path, disposal_timeout_hours) {
            Ok(id) => Response::TransferId(id),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::SetTransferStatus { local_path, status } => {
            match engine.set_transfer_status(&local_path, status) {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::TransferInformation(id) => match engine.transfer_information(&id) {
            Ok((local, remote, expiry, workflow)) => {
                Response::TransferInformation(local, remote, expiry, workflow)
            }
            Err(e) => Response::Error(e.to_string()),
        },
        Request::CancelTransfer(id) => match engine.cancel_transfer(&id) {
            Ok(()) => Response::Ack,
            Err(e) => Response::Error(e.to_string()),
        },

        Request::Jobs => Response::Ids(engine.jobs()),
        Request::Transfers => Response::Ids(engine.transfers()),
        Request::Workflows => Response::Ids(engine.workflows()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SnapshotDb;
    use crate::job::Job;
    use crate::scheduler::local::Local;

    #[test]
    fn handles_ping_and_submit() {
        let db = Arc::new(SnapshotDb::in_memory());
        let scheduler = Local::new(2);
        let engine = Engine::new(db, scheduler, std::env::temp_dir());

        assert!(matches!(handle_request(&engine, Request::Ping), Response::Pong));

        let job = Job::new(String::new(), vec!["/bin/true".into()]).unwrap();
        assert!(matches!(
            handle_request(&engine, Request::Submit(job)),
            Response::JobId(_)
        ));

        engine.shutdown();
    }

    #[test]
    fn connection_checker_detects_staleness() {
        let checker = ConnectionChecker::new();
        assert!(!checker.is_stale());
        *checker.last_signal.lock().unwrap() = Instant::now() - Duration::from_secs(100);
        assert!(checker.is_stale());
        checker.signal();
        assert!(!checker.is_stale());
    }
}
