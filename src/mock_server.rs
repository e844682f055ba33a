//! [`MockServer`] and [`send_traffic`]: replay-time network emulation.
//!
//! Ported from the original `SocketTraffic` class
//! (`mock_socket_traffic.h`/`.cc`), generalized from "read and log" into
//! actually driving the recorded conversation through a [`TraceGroup`]
//! instead of discarding the bytes.

use crate::error::{Result, TraceError};
use crate::socket::{ConnectedSocket, ListeningSocket};
use crate::trace::{Mode, Trace};
use crate::trace_group::TraceGroup;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const IDLE_CLOSE_SLEEP: Duration = Duration::from_secs(50);

/// Listens on a set of ports and replays each accepted connection's
/// recorded conversation from a per-port [`TraceGroup`].
pub struct MockServer {
    shutdown: Arc<AtomicBool>,
    accept_handles: Vec<JoinHandle<()>>,
}

impl MockServer {
    /// Scans `recordings_dir` for `accept`-side recordings of each port in
    /// `ports`, binds `host:port`, and starts an accept thread per port.
    pub fn new(recordings_dir: &Path, host: &str, ports: &[u16]) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut accept_handles = Vec::with_capacity(ports.len());

        for &port in ports {
            let group = Arc::new(Mutex::new(load_trace_group(recordings_dir, port, "accept")?));
            let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|_| {
                TraceError::MalformedConnectionInfo(format!("{}:{}", host, port))
            })?;
            let listener = ListeningSocket::bind(addr)?;
            let shutdown = Arc::clone(&shutdown);

            let handle = std::thread::Builder::new()
                .name(format!("rr-mock-accept-{}", port))
                .spawn(move || accept_loop(listener, group, shutdown, port))?;
            accept_handles.push(handle);
        }

        Ok(MockServer { shutdown, accept_handles })
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Accepting threads only notice `shutdown` between connections (the
        // blocking `accept()` call itself cannot be interrupted without a
        // platform-specific wakeup mechanism); this mirrors the original's
        // destructor, which has the same limitation.
        for handle in self.accept_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: ListeningSocket, group: Arc<Mutex<TraceGroup>>, shutdown: Arc<AtomicBool>, port: u16) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((socket, peer)) => {
                tracing::info!(port, %peer, "accepted connection");
                let group = Arc::clone(&group);
                let _ = std::thread::Builder::new()
                    .name(format!("rr-mock-conn-{}", port))
                    .spawn(move || replay_trace(socket, group, IDLE_CLOSE_SLEEP));
            }
            Err(e) => {
                tracing::warn!(port, error = %e, "accept failed");
                return;
            }
        }
    }
}

/// Drives one accepted (or outbound) connection from `group` until the
/// group is exhausted, the peer diverges from every surviving candidate, or
/// an I/O error occurs. None of these end the process or poison the engine
/// — only this connection's thread exits.
fn replay_trace(mut socket: ConnectedSocket, group: Arc<Mutex<TraceGroup>>, idle_close_sleep: Duration) {
    loop {
        loop {
            let (should_read, all_empty) = {
                let g = group.lock().unwrap();
                (g.next_is_read_or_empty(), g.all_empty())
            };
            if all_empty || !should_read {
                break;
            }
            let mut buf = [0u8; READ_BUFFER_SIZE];
            match socket.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("replay_trace: peer closed connection while a read was expected");
                    return;
                }
                Ok(n) => {
                    let mut g = group.lock().unwrap();
                    if let Err(e) = g.consume_read(&buf[..n]) {
                        tracing::error!(error = %e, "replay_trace: trace group diverged on read");
                        let _ = socket.shutdown();
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "replay_trace: socket read failed");
                    let _ = socket.shutdown();
                    return;
                }
            }
        }

        loop {
            let should_write = group.lock().unwrap().next_is_write();
            if !should_write {
                break;
            }
            let mut buf = [0u8; READ_BUFFER_SIZE];
            let n = {
                let mut g = group.lock().unwrap();
                match g.next_common_write(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(error = %e, "replay_trace: trace group diverged on write");
                        let _ = socket.shutdown();
                        return;
                    }
                }
            };
            if let Err(e) = socket.write_all(&buf[..n]) {
                tracing::error!(error = %e, "replay_trace: socket write failed");
                let _ = socket.shutdown();
                return;
            }
        }

        let (all_empty, should_read, should_write) = {
            let g = group.lock().unwrap();
            (g.all_empty(), g.next_is_read_or_empty(), g.next_is_write())
        };
        if all_empty {
            tracing::info!("replay_trace: trace group exhausted, holding connection open briefly before closing");
            std::thread::sleep(idle_close_sleep);
            let _ = socket.shutdown();
            return;
        }
        if !should_read && !should_write {
            tracing::error!("replay_trace: trace group can neither read nor write; closing connection");
            let _ = socket.shutdown();
            return;
        }
    }
}

/// Parses `connection_info` into `(client_addr, server_addr)`. Expected
/// format: `<client_host>:<client_port>#<server_host>:<server_port>`.
fn parse_connection_info(connection_info: &str) -> Result<(String, String)> {
    let mut parts = connection_info.splitn(2, '#');
    let client = parts.next().unwrap_or("");
    let server = parts.next();
    match server {
        Some(server) if !client.is_empty() && !server.is_empty() => Ok((client.to_string(), server.to_string())),
        _ => Err(TraceError::MalformedConnectionInfo(connection_info.to_string())),
    }
}

fn load_trace_group(recordings_dir: &Path, port: u16, filter: &str) -> Result<TraceGroup> {
    let mut group = TraceGroup::new();
    for path in discover_trace_files(recordings_dir, &port.to_string(), filter)? {
        let prefix = strip_bin_suffix(&path);
        let mut trace = Trace::new(&prefix, Mode::Replay, false)?;
        trace.coalesce();
        group.add_trace(trace);
    }
    tracing::info!(port, candidates = group.candidate_count(), "loaded trace group");
    Ok(group)
}

/// Lists `recordings_dir` entries matching the `socket_rec_` naming
/// convention: name contains `socket_rec_`, contains `needle` (a port number
/// or a `connect_from_..._from_...` filter), contains `filter`, and ends in
/// `.bin`.
fn discover_trace_files(recordings_dir: &Path, needle: &str, filter: &str) -> Result<Vec<PathBuf>> {
    let mut matches = Vec::new();
    let entries = match std::fs::read_dir(recordings_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(matches),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains("socket_rec_") && name.contains(needle) && name.contains(filter) && name.ends_with(".bin") {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

fn strip_bin_suffix(path: &Path) -> String {
    let s = path.to_string_lossy();
    s.strip_suffix(".bin").unwrap_or(&s).to_string()
}

/// Parses `connection_info`, binds the client endpoint and connects to the
/// server endpoint, loads the matching `connect_from_..._from_...`
/// recording, and spawns a thread replaying it over the new connection.
/// Used to drive previously-recorded client-originated traffic against a
/// live server during replay.
pub fn send_traffic(recordings_dir: &Path, connection_info: &str) -> Result<JoinHandle<()>> {
    let (client, server) = parse_connection_info(connection_info)?;
    let client_addr: SocketAddr = client
        .parse()
        .map_err(|_| TraceError::MalformedConnectionInfo(connection_info.to_string()))?;
    let server_addr: SocketAddr = server
        .parse()
        .map_err(|_| TraceError::MalformedConnectionInfo(connection_info.to_string()))?;

    let filter = format!("connect_from_{}_from_{}", client, server);
    let mut group = TraceGroup::new();
    for path in discover_trace_files(recordings_dir, &filter, "")? {
        let prefix = strip_bin_suffix(&path);
        let mut trace = Trace::new(&prefix, Mode::Replay, false)?;
        trace.coalesce();
        group.add_trace(trace);
    }
    if group.candidate_count() == 0 {
        return Err(TraceError::Corrupted {
            parsed: 0,
            reason: format!("no recorded trace matched connection_info {:?}", connection_info),
        });
    }

    let socket = ConnectedSocket::connect_from(client_addr, server_addr)?;
    let group = Arc::new(Mutex::new(group));
    let handle = std::thread::Builder::new()
        .name("rr-send-traffic".into())
        .spawn(move || replay_trace(socket, group, IDLE_CLOSE_SLEEP))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryPayload, OpaqueEntry};
    use tempfile::tempdir;

    fn record_socket_trace(prefix: &str, entries: Vec<OpaqueEntry>) {
        let mut t = Trace::new(prefix, Mode::Record, true).unwrap();
        for e in entries {
            t.record(e).unwrap();
        }
    }

    #[test]
    fn parses_connection_info() {
        assert_eq!(
            parse_connection_info("10.0.0.1:9000#10.0.0.2:7000").unwrap(),
            ("10.0.0.1:9000".to_string(), "10.0.0.2:7000".to_string())
        );
        assert!(parse_connection_info("no-hash-here").is_err());
        assert!(parse_connection_info("#missing-client").is_err());
    }

    #[test]
    fn replay_trace_drives_read_then_write_then_closes() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("socket_rec_accept_7000").to_str().unwrap().to_string();
        record_socket_trace(
            &prefix,
            vec![
                OpaqueEntry::new(1, "Socket Read").with_payload(EntryPayload::Bytes(b"ping".to_vec())),
                OpaqueEntry::new(1, "Socket Write").with_payload(EntryPayload::Bytes(b"pong".to_vec())),
            ],
        );
        let mut trace = Trace::new(&prefix, Mode::Replay, false).unwrap();
        trace.coalesce();
        let mut group = TraceGroup::new();
        group.add_trace(trace);
        let group = Arc::new(Mutex::new(group));

        let listener = crate::socket::ListeningSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let server_handle = std::thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            replay_trace(socket, group, Duration::from_millis(5));
        });

        let mut client = crate::socket::ConnectedSocket::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        server_handle.join().unwrap();
    }

    #[test]
    fn discover_trace_files_filters_by_needle_and_suffix() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("socket_rec_accept_7000.bin"), b"").unwrap();
        std::fs::write(dir.path().join("socket_rec_accept_7000.txt"), b"").unwrap();
        std::fs::write(dir.path().join("socket_rec_accept_7001.bin"), b"").unwrap();
        std::fs::write(dir.path().join("unrelated.bin"), b"").unwrap();

        let found = discover_trace_files(dir.path(), "7000", "accept").unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].to_string_lossy().ends_with("socket_rec_accept_7000.bin"));
    }
}
