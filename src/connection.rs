// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of weft, released under the BSD 3-Clause License.

//! The connection layer: obtains a proxy to the
//! engine host process, optionally tunnelled over SSH, and runs the
//! client-side heartbeat that keeps it alive.
//!
//! Local connections spawn the engine host as a subprocess and read its
//! startup banner directly; remote connections open an SSH session, forward
//! both banner ports through `direct-tcpip` tunnels, and probe connectivity
//! before handing back a proxy. Everything here is thread-based and
//! blocking, matching the rest of this crate: no async runtime.

use log::{debug, info, trace, warn};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::rpc::EngineProxy;
use crate::{
    Error, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_TUNNEL_PROBE_ATTEMPTS,
};

/// The two startup banner lines the engine host must print: `<label>
/// <uri>`, engine first, then the heartbeat receiver.
struct Banner {
    engine_uri: Uri,
    heartbeat_uri: Uri,
}

/// A parsed `tcp://<host>:<port>` banner URI.
#[derive(Clone, Debug)]
struct Uri {
    host: String,
    port: u16,
}

impl Uri {
    fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix("tcp://")?;
        let (host, port) = rest.rsplit_once(':')?;
        Some(Uri {
            host: host.to_string(),
            port: port.trim().parse().ok()?,
        })
    }
}

/// Read the engine host's two-line startup banner from `reader`, matching
/// the labels `workflow_engine_<login>` and `connection_checker` in order.
/// Extra log lines before or between them are tolerated and skipped.
///
/// # Errors
/// Returns [`Error::Connection`] if either line is missing before the
/// underlying stream ends.
fn read_banner<R: BufRead>(reader: &mut R, login: &str) -> Result<Banner, Error> {
    let engine_label = format!("workflow_engine_{login}");

    let engine_uri = read_labelled_uri(reader, &engine_label)?;
    let heartbeat_uri = read_labelled_uri(reader, "connection_checker")?;

    Ok(Banner {
        engine_uri,
        heartbeat_uri,
    })
}

fn read_labelled_uri<R: BufRead>(reader: &mut R, label: &str) -> Result<Uri, Error> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::Connection(format!("reading engine banner: {e}")))?;
        if read == 0 {
            return Err(Error::Connection(format!(
                "engine exited before printing the '{label}' banner line"
            )));
        }
        let mut parts = line.split_whitespace();
        let Some(found_label) = parts.next() else {
            continue;
        };
        if found_label != label {
            trace!("Ignoring banner line '{}'.", line.trim_end());
            continue;
        }
        let Some(uri_text) = parts.next() else {
            continue;
        };
        return Uri::parse(uri_text)
            .ok_or_else(|| Error::Connection(format!("malformed URI in banner: '{uri_text}'")));
    }
}

/// A live connection to an engine host process, plus the heartbeat thread
/// and (for remote resources) the SSH tunnel keeping it reachable.
pub struct EngineHandle {
    pub proxy: std::sync::Mutex<EngineProxy>,
    heartbeat_shutdown: Arc<AtomicBool>,
    heartbeat_thread: Option<JoinHandle<()>>,
    #[allow(dead_code)] // keeps the tunnel's background thread alive for the handle's lifetime
    tunnel: Option<Tunnel>,
}

impl EngineHandle {
    /// Spawn the engine host as a local subprocess and read its startup
    /// banner from its piped stdout.
    ///
    /// # Errors
    /// Returns [`Error::Connection`] if the banner cannot be read within the
    /// process's lifetime, or [`Error::IO`] if the binary cannot be spawned.
    pub fn connect_local(
        engine_binary: &Path,
        resource_id: &str,
        object_name: &str,
        log_tag: &str,
    ) -> Result<Self, Error> {
        let login = whoami_login();

        let mut child = Command::new(engine_binary)
            .arg(resource_id)
            .arg(object_name)
            .arg(log_tag)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnProcess(engine_binary.display().to_string(), e))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout);
        let banner = read_banner(&mut reader, &login)?;

        // The child keeps running independently as a long-lived host
        // process; dropping our handle to it here is intentional.
        std::mem::forget(child);

        let proxy = EngineProxy::connect((banner.engine_uri.host.as_str(), banner.engine_uri.port))?;
        let heartbeat = start_heartbeat(banner.heartbeat_uri)?;

        Ok(EngineHandle {
            proxy: std::sync::Mutex::new(proxy),
            heartbeat_shutdown: heartbeat.0,
            heartbeat_thread: Some(heartbeat.1),
            tunnel: None,
        })
    }

    /// Spawn the engine host on a remote submitting host over SSH and
    /// tunnel RPC and heartbeat traffic back through local ports.
    ///
    /// `remote_entry_point` is the single command-line invocation run over
    /// SSH to start the engine host binary on the remote host.
    ///
    /// # Errors
    /// Returns [`Error::Connection`] if the SSH session fails, the banner
    /// cannot be read, or the tunnel fails its connectivity probe within
    /// `DEFAULT_TUNNEL_PROBE_ATTEMPTS` one-second-spaced attempts.
    pub fn connect_remote(
        submitting_host: &str,
        login: &str,
        remote_entry_point: &str,
        resource_id: &str,
        object_name: &str,
        log_tag: &str,
    ) -> Result<Self, Error> {
        let tcp = TcpStream::connect((submitting_host, 22))
            .map_err(|e| Error::Connection(format!("connecting to {submitting_host}:22: {e}")))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| Error::Connection(format!("starting SSH session: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| Error::Connection(format!("SSH handshake: {e}")))?;
        session
            .userauth_agent(login)
            .map_err(|e| Error::Connection(format!("SSH agent authentication: {e}")))?;
        if !session.authenticated() {
            return Err(Error::Connection(
                "SSH agent authentication did not succeed".into(),
            ));
        }

        let command = format!("{remote_entry_point} {resource_id} {object_name} {log_tag}");
        info!("start engine command: {command}");

        let mut channel = session
            .channel_session()
            .map_err(|e| Error::Connection(format!("opening SSH channel: {e}")))?;
        channel
            .exec(&command)
            .map_err(|e| Error::Connection(format!("executing '{command}': {e}")))?;

        let mut reader = BufReader::new(channel);
        let banner = read_banner(&mut reader, login)?;
        let channel = reader.into_inner();
        // Leave the exec channel running for the lifetime of the remote
        // engine host; we only needed its stdout to read the banner.
        std::mem::forget(channel);

        // Everything past this point (opening `direct-tcpip` channels and
        // copying bytes through them) uses the session in non-blocking mode,
        // per ssh2's documented port-forwarding pattern: channel reads/writes
        // return `io::ErrorKind::WouldBlock` instead of parking a thread
        // inside libssh2, so one relay loop can poll both the local socket
        // and the channel without a second mutable borrow of either.
        session.set_blocking(false);
        let session = Arc::new(session);

        let local_rpc_port = free_local_port()?;
        let tunnel = Tunnel::start(
            Arc::clone(&session),
            local_rpc_port,
            submitting_host.to_string(),
            banner.engine_uri.port,
        )?;

        let local_heartbeat_port = free_local_port()?;
        let _heartbeat_tunnel = Tunnel::start(
            Arc::clone(&session),
            local_heartbeat_port,
            submitting_host.to_string(),
            banner.heartbeat_uri.port,
        )?;

        let mut proxy = probe_until_connected(
            ("127.0.0.1", local_rpc_port),
            DEFAULT_TUNNEL_PROBE_ATTEMPTS,
        )?;
        proxy.ping()?;

        let heartbeat = start_heartbeat(Uri {
            host: "127.0.0.1".to_string(),
            port: local_heartbeat_port,
        })?;

        Ok(EngineHandle {
            proxy: std::sync::Mutex::new(proxy),
            heartbeat_shutdown: heartbeat.0,
            heartbeat_thread: Some(heartbeat.1),
            tunnel: Some(tunnel),
        })
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.heartbeat_shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.heartbeat_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Probe connectivity with a trivial engine call up to `attempts` times,
/// one second apart.
///
/// # Errors
/// Returns [`Error::Connection`] once `attempts` is exhausted.
fn probe_until_connected(
    addr: impl std::net::ToSocketAddrs + Clone,
    attempts: u32,
) -> Result<EngineProxy, Error> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match EngineProxy::connect(addr.clone()) {
            Ok(mut proxy) => match proxy.ping() {
                Ok(()) => return Ok(proxy),
                Err(e) => last_error = Some(e),
            },
            Err(e) => last_error = Some(e),
        }
        debug!("Tunnel connectivity probe {attempt}/{attempts} failed, retrying.");
        thread::sleep(Duration::from_secs(1));
    }
    Err(Error::Connection(format!(
        "tunnel did not become reachable within {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Spawn the client-side heartbeat thread: signal the
/// connection-checker every `DEFAULT_HEARTBEAT_INTERVAL_SECS` seconds.
fn start_heartbeat(uri: Uri) -> Result<(Arc<AtomicBool>, JoinHandle<()>), Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let thread_shutdown = Arc::clone(&shutdown);

    let handle = thread::Builder::new()
        .name("weft-heartbeat".into())
        .spawn(move || {
            while !thread_shutdown.load(Ordering::Relaxed) {
                if let Ok(mut stream) = TcpStream::connect((uri.host.as_str(), uri.port)) {
                    let _ = stream.write_all(&[1u8]);
                } else {
                    warn!("Heartbeat signal to {}:{} failed.", uri.host, uri.port);
                }
                thread::sleep(Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));
            }
        })
        .map_err(Error::IO)?;

    Ok((shutdown, handle))
}

fn free_local_port() -> Result<u16, Error> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(Error::IO)?;
    listener.local_addr().map(|addr| addr.port()).map_err(Error::IO)
}

fn whoami_login() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "user".to_string())
}

/// A local-port-forwarded SSH tunnel: accepts connections on a local port
/// and relays bytes to a fixed remote `(host, port)` over an SSH
/// `direct-tcpip` channel per connection.
///
/// One accept loop per tunnel, one relay per incoming connection. Each
/// relay runs a single non-blocking poll loop rather than a reader/writer
/// thread pair, since `ssh2::Channel` cannot be split into independent
/// read/write halves for two threads to own.
struct Tunnel {
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl Tunnel {
    fn start(
        session: Arc<ssh2::Session>,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(("127.0.0.1", local_port)).map_err(Error::IO)?;
        listener.set_nonblocking(true).map_err(Error::IO)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);

        let accept_thread = thread::Builder::new()
            .name(format!("weft-tunnel-{local_port}"))
            .spawn(move || {
                while !thread_shutdown.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((local_stream, peer)) => {
                            trace!("Tunnel {local_port} accepted connection from {peer}.");
                            let session = Arc::clone(&session);
                            let remote_host = remote_host.clone();
                            thread::spawn(move || {
                                relay_connection(&session, local_stream, &remote_host, remote_port);
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(20));
                        }
                        Err(e) => {
                            warn!("Tunnel {local_port} accept failed: {e}.");
                            break;
                        }
                    }
                }
            })
            .map_err(Error::IO)?;

        Ok(Tunnel {
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// True when `error` is libssh2's EAGAIN, surfaced through `ssh2::Error`'s
/// message rather than a typed variant (the crate does not expose a stable
/// "would block" predicate on channel-open errors the way it does on
/// `Read`/`Write`, which map EAGAIN to `io::ErrorKind::WouldBlock`
/// directly).
fn is_would_block(error: &ssh2::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("again") || message.contains("would block")
}

/// Open a `direct-tcpip` channel, retrying while the non-blocking session
/// reports EAGAIN.
fn open_direct_tcpip(
    session: &ssh2::Session,
    host: &str,
    port: u16,
) -> Result<ssh2::Channel, Error> {
    loop {
        match session.channel_direct_tcpip(host, port, None) {
            Ok(channel) => return Ok(channel),
            Err(e) if is_would_block(&e) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                return Err(Error::Connection(format!(
                    "opening tunnel channel to {host}:{port}: {e}"
                )))
            }
        }
    }
}

/// Relay bytes between `local_stream` and a freshly opened `direct-tcpip`
/// channel to `(remote_host, remote_port)` until either side closes.
///
/// Polls both the client socket and the SSH channel in a single
/// non-blocking loop rather than blocking on either side, since
/// `ssh2::Channel` cannot be split into independent read/write halves for
/// two threads to own.
fn relay_connection(
    session: &ssh2::Session,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) {
    let peer = local_stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let mut channel = match open_direct_tcpip(session, remote_host, remote_port) {
        Ok(channel) => channel,
        Err(e) => {
            warn!("Tunnel relay to {remote_host}:{remote_port} rejected: {e}.");
            return;
        }
    };

    if let Err(e) = local_stream.set_nonblocking(true) {
        warn!("Failed to set tunnel socket nonblocking: {e}.");
        return;
    }

    let mut buf = [0u8; 8192];
    loop {
        let mut made_progress = false;

        match local_stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if channel.write_all(&buf[..n]).is_err() {
                    break;
                }
                made_progress = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    break;
                }
            }
            Ok(n) => {
                if local_stream.write_all(&buf[..n]).is_err() {
                    break;
                }
                made_progress = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        if !made_progress {
            thread::sleep(Duration::from_millis(5));
        }
    }

    let _ = channel.close();
    trace!("Tunnel closed from {peer}.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_uri() {
        let uri = Uri::parse("tcp://127.0.0.1:4242").unwrap();
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, 4242);
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(Uri::parse("not-a-uri").is_none());
    }

    #[test]
    fn reads_banner_ignoring_extra_lines() {
        let input = b"starting up\nworkflow_engine_alice tcp://127.0.0.1:9000\nconnection_checker tcp://127.0.0.1:9001\n";
        let mut reader = BufReader::new(&input[..]);
        let banner = read_banner(&mut reader, "alice").unwrap();
        assert_eq!(banner.engine_uri.port, 9000);
        assert_eq!(banner.heartbeat_uri.port, 9001);
    }

    #[test]
    fn missing_banner_line_errors() {
        let input = b"workflow_engine_alice tcp://127.0.0.1:9000\n";
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(
            read_banner(&mut reader, "alice"),
            Err(Error::Connection(_))
        ));
    }
}
