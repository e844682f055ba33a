//! [`Trace`]: a linearly ordered, on-disk-backed sequence of [`OpaqueEntry`]
//! with record and replay state machines.

use crate::codec;
use crate::entry::OpaqueEntry;
use crate::error::{Result, TraceError};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Record,
    Replay,
}

/// Picks the trace file names for `prefix`. In record mode, when
/// `overwrite` is false, probes `prefix.0.bin`, `prefix.1.bin`, ... for the
/// first unused numeric suffix, mirroring the original's
/// `while (ifstream(prefix + "." + i + ".bin")) i++;` scan.
fn choose_paths(prefix: &str, mode: Mode, overwrite: bool) -> (PathBuf, PathBuf) {
    if mode == Mode::Record && !overwrite {
        let mut i = 0u32;
        loop {
            let candidate = format!("{}.{}.bin", prefix, i);
            if !Path::new(&candidate).exists() {
                return (
                    PathBuf::from(format!("{}.{}.bin", prefix, i)),
                    PathBuf::from(format!("{}.{}.txt", prefix, i)),
                );
            }
            i += 1;
        }
    }
    (PathBuf::from(format!("{}.bin", prefix)), PathBuf::from(format!("{}.txt", prefix)))
}

/// Single-threaded trace representation; callers (the replay engine) are
/// expected to serialize access via an external mutex exactly as the
/// original requires.
pub struct Trace {
    mode: Mode,
    bin_path: PathBuf,
    txt_path: PathBuf,
    bin_writer: Option<BufWriter<File>>,
    txt_writer: Option<BufWriter<File>>,
    events: VecDeque<OpaqueEntry>,
    pos: usize,
    soft_consumed: Option<usize>,
    debug_thread: Option<JoinHandle<()>>,
    debug_thread_exit: Arc<AtomicBool>,
    debug_snapshot: Arc<Mutex<DebugSnapshot>>,
}

/// What the background debug thread renders each tick: the cursor, the
/// trace size, and the current head's debug string. Kept separate from
/// `Trace`'s own fields so the debug thread never needs a reference into
/// `events`.
#[derive(Default, Clone)]
struct DebugSnapshot {
    pos: usize,
    size: usize,
    head_debug: Option<String>,
}

impl Trace {
    /// Constructs a trace for `prefix` in `mode`. In replay mode the binary
    /// file is fully parsed into memory before this returns (matching the
    /// original's eager load), and a background thread is spawned that
    /// periodically logs the current cursor position and the head entry's
    /// debug rendering, for diagnosing stuck replays.
    pub fn new(prefix: &str, mode: Mode, overwrite: bool) -> Result<Self> {
        let (bin_path, txt_path) = choose_paths(prefix, mode, overwrite);

        if mode == Mode::Record && overwrite {
            let _ = std::fs::remove_file(&bin_path);
            let _ = std::fs::remove_file(&txt_path);
        }

        let mut events = VecDeque::new();
        let debug_thread_exit = Arc::new(AtomicBool::new(false));
        let mut debug_thread = None;
        let debug_snapshot = Arc::new(Mutex::new(DebugSnapshot::default()));

        match mode {
            Mode::Record => {
                let bin_file = OpenOptions::new().create(true).append(true).open(&bin_path)?;
                let txt_file = OpenOptions::new().create(true).append(true).open(&txt_path)?;
                return Ok(Trace {
                    mode,
                    bin_path,
                    txt_path,
                    bin_writer: Some(BufWriter::new(bin_file)),
                    txt_writer: Some(BufWriter::new(txt_file)),
                    events,
                    pos: 0,
                    soft_consumed: None,
                    debug_thread,
                    debug_thread_exit,
                    debug_snapshot,
                });
            }
            Mode::Replay => {
                let mut bin_file = match File::open(&bin_path) {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tracing::info!(path = %bin_path.display(), "trace parsed 0 events for replay (file does not exist)");
                        File::create(&bin_path)?;
                        File::open(&bin_path)?
                    }
                    Err(e) => return Err(e.into()),
                };
                let parsed = codec::read_all_entries(&mut bin_file)?;
                tracing::info!(count = parsed.len(), "trace parsed events for replay");
                events = parsed.into_iter().collect();
                *debug_snapshot.lock().unwrap() =
                    DebugSnapshot { pos: 0, size: events.len(), head_debug: events.front().map(|e| e.short_debug_string()) };

                let exit_flag = debug_thread_exit.clone();
                let snapshot = debug_snapshot.clone();
                let handle = std::thread::Builder::new()
                    .name("trace-debug".into())
                    .spawn(move || debug_thread_loop(exit_flag, snapshot, Duration::from_secs(1)))
                    .expect("failed to spawn trace debug thread");
                debug_thread = Some(handle);
            }
        }

        Ok(Trace {
            mode,
            bin_path,
            txt_path,
            bin_writer: None,
            txt_writer: None,
            events,
            pos: 0,
            soft_consumed: None,
            debug_thread,
            debug_thread_exit,
            debug_snapshot,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_replay(&self) -> bool {
        self.mode == Mode::Replay
    }

    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    pub fn txt_path(&self) -> &Path {
        &self.txt_path
    }

    pub fn size(&self) -> usize {
        self.events.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn has_next(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends `entry` to both the binary and mirrored text files, flushes
    /// both, and returns the pre-increment index. Record mode only.
    pub fn record(&mut self, entry: OpaqueEntry) -> Result<usize> {
        debug_assert_eq!(self.mode, Mode::Record);
        let bin = self.bin_writer.as_mut().expect("record() called outside record mode");
        let txt = self.txt_writer.as_mut().expect("record() called outside record mode");
        codec::write_entry(bin, txt, &entry)?;
        let pos = self.pos;
        self.pos += 1;
        Ok(pos)
    }

    /// Returns a reference to the head entry along with the current replay
    /// cursor. Replay mode only; fails if the trace is empty.
    pub fn peek_next(&self) -> Result<(&OpaqueEntry, usize)> {
        debug_assert_eq!(self.mode, Mode::Replay);
        match self.events.front() {
            Some(e) => Ok((e, self.pos)),
            None => Err(TraceError::UnexpectedEof),
        }
    }

    /// Asserts `expected_pos` names the current head, pops it, and advances
    /// the cursor. If a soft consumption is outstanding it must be on the
    /// same head; it is cleared.
    pub fn consume_head(&mut self, expected_pos: usize) -> Result<OpaqueEntry> {
        debug_assert_eq!(self.mode, Mode::Replay);
        if self.events.is_empty() {
            return Err(TraceError::UnexpectedEof);
        }
        assert_eq!(
            expected_pos, self.pos,
            "consume_head called with a stale position: expected head at {}, caller has {}",
            self.pos, expected_pos
        );
        if let Some(soft) = self.soft_consumed {
            assert_eq!(soft, self.pos, "soft-consumed position does not match the head being consumed");
        }
        let entry = self.events.pop_front().expect("checked non-empty above");
        self.pos += 1;
        self.soft_consumed = None;
        self.refresh_debug_snapshot();
        Ok(entry)
    }

    /// Publishes the current cursor/size/head for the background debug
    /// thread to read. A no-op outside replay mode (no debug thread exists
    /// there to read it).
    fn refresh_debug_snapshot(&self) {
        if self.mode != Mode::Replay {
            return;
        }
        let mut snapshot = self.debug_snapshot.lock().unwrap();
        snapshot.pos = self.pos;
        snapshot.size = self.events.len();
        snapshot.head_debug = self.events.front().map(|e| e.short_debug_string());
    }

    /// Marks the head as soft-consumed, reserved for a pending reproducer
    /// callback, without removing it. Returns `false` (and does nothing) if
    /// a different soft consumption is already outstanding.
    pub fn soft_consume_head(&mut self, expected_pos: usize) -> bool {
        debug_assert_eq!(self.mode, Mode::Replay);
        if self.soft_consumed.is_some() {
            // A soft consumption is already outstanding (whether or not it
            // happens to be on this same head) — not our turn to set it.
            return false;
        }
        assert_eq!(expected_pos, self.pos, "soft_consume_head called on a non-head entry");
        self.soft_consumed = Some(self.pos);
        true
    }

    pub fn soft_consumed_pos(&self) -> Option<usize> {
        self.soft_consumed
    }

    /// One-shot post-load optimization: fuses adjacent entries that share an
    /// `rr_debug_string` equal to `"Socket Read"`, `"Socket Write"`, or a
    /// `"Socket writev of ..."` prefix. Only meaningful immediately after
    /// load (`pos() == 0`); calling it again is a no-op because there is
    /// nothing left to fuse once adjacent runs have already been merged.
    pub fn coalesce(&mut self) {
        debug_assert_eq!(self.mode, Mode::Replay);
        if self.events.is_empty() {
            return;
        }
        let orig_len = self.events.len();
        let mut fused: VecDeque<OpaqueEntry> = VecDeque::new();
        for entry in self.events.drain(..) {
            let fusible = entry.is_socket_read() || entry.is_socket_write();
            match fused.back_mut() {
                Some(last) if fusible && last.rr_debug_string == entry.rr_debug_string => {
                    let mut bytes = last.bytes_payload().unwrap_or(&[]).to_vec();
                    bytes.extend_from_slice(entry.bytes_payload().unwrap_or(&[]));
                    last.body_size += entry.body_size;
                    last.payload = crate::entry::EntryPayload::Bytes(bytes);
                }
                _ => fused.push_back(entry),
            }
        }
        tracing::info!(from = orig_len, to = fused.len(), "coalesced socket read/write runs");
        self.events = fused;
        self.refresh_debug_snapshot();
    }

    /// Used only by [`crate::trace_group::TraceGroup`], which manages a set
    /// of candidate socket-recording traces outside the engine's normal
    /// peek/consume/soft-consume protocol (those traces are never touched by
    /// application-driven SaveRestore/RecordReplay calls).
    pub(crate) fn front(&self) -> Option<&OpaqueEntry> {
        self.events.front()
    }

    pub(crate) fn pop_front_unchecked(&mut self) -> Option<OpaqueEntry> {
        let e = self.events.pop_front();
        if e.is_some() {
            self.pos += 1;
        }
        e
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        if let Some(w) = self.bin_writer.as_mut() {
            let _ = w.flush();
        }
        if let Some(w) = self.txt_writer.as_mut() {
            let _ = w.flush();
        }
        self.debug_thread_exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.debug_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Mirrors the original's `DebugThread`: once per `period`, logs the
/// cursor, the trace size, and the current head's debug rendering so a
/// stuck replay shows up in the logs instead of just hanging silently.
fn debug_thread_loop(do_exit: Arc<AtomicBool>, snapshot: Arc<Mutex<DebugSnapshot>>, period: Duration) {
    while !do_exit.load(Ordering::SeqCst) {
        std::thread::sleep(period);
        if do_exit.load(Ordering::SeqCst) {
            break;
        }
        let snapshot = snapshot.lock().unwrap().clone();
        tracing::debug!(
            pos = snapshot.pos,
            size = snapshot.size,
            head = snapshot.head_debug.as_deref().unwrap_or("<empty>"),
            "trace debug thread tick"
        );
    }
}
