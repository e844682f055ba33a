//! [`ReplayEngine`]: the single mediator of every record/replay API call.
//!
//! Ported from the original `Airreplay` class (`airreplay.h`/`airreplay.cc`).
//! All engine state — the trace cursor, the reproducer registry, the
//! save-restore key set, the thread-id map, the replay-attempt counter and
//! the soft-consumption slot — lives behind one `Mutex<EngineState>`,
//! matching the original's single `recordOrder_` mutex.

use crate::compare::{CompareOutcome, JsonValueComparator, MessageComparator};
use crate::entry::{EntryPayload, OpaqueEntry, WrappedMessage};
use crate::error::{Result, TraceError};
use crate::kinds;
use crate::trace::{Mode, Trace};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

type ReproducerFn = dyn Fn(&str, &WrappedMessage) + Send + Sync;

/// Tuning knobs that the original hard-codes as constants. Exposed here so
/// tests can shrink the backoffs instead of waiting out the real timings.
pub struct EngineConfig {
    pub save_restore_backoff: Duration,
    pub record_replay_backoff: Duration,
    pub external_replayer_interval: Duration,
    pub max_attempts: u32,
    pub warn_escalation_threshold: u32,
    pub worker_pool_size: usize,
    /// Threads whose current name satisfies this predicate short-circuit
    /// [`ReplayEngine::save_restore_per_thread`] to `-1`. Defaults to the
    /// kuduraft integration's `*-negotiator` / `*acceptor` name match, but is
    /// configurable here instead of being hard-coded.
    pub thread_short_circuit: Box<dyn Fn(&str) -> bool + Send + Sync>,
    pub comparator: Box<dyn MessageComparator>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            save_restore_backoff: Duration::from_millis(400),
            record_replay_backoff: Duration::from_millis(100),
            external_replayer_interval: Duration::from_millis(200),
            max_attempts: 400,
            warn_escalation_threshold: 20,
            worker_pool_size: 4,
            thread_short_circuit: Box::new(|name: &str| name.contains("-negotiator") || name.contains("acceptor")),
            comparator: Box::new(JsonValueComparator::default()),
        }
    }
}

struct EngineState {
    trace: Trace,
    save_restore_keys: HashSet<String>,
    thread_id_map: HashMap<u64, u64>,
    reproducers: HashMap<i32, Arc<ReproducerFn>>,
    kind_names: HashMap<i32, String>,
}

/// The value slot a SaveRestore call reads from (record mode) or writes
/// into (replay mode). Modeling this as a reference-carrying enum keeps
/// "exactly one of four value kinds" a call-site fact instead of four
/// optional out-parameters.
pub enum SaveRestoreSlot<'a> {
    Message(&'a mut WrappedMessage),
    Bytes(&'a mut Vec<u8>),
    Num(&'a mut u64),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerPool {
    sender: Option<crossbeam_channel::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rr-reproducer-{}", i))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn reproducer worker thread");
            handles.push(handle);
        }
        WorkerPool { sender: Some(tx), handles }
    }

    fn dispatch(&self, job: Job) {
        if let Some(tx) = &self.sender {
            let _ = tx.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Mediates every record/replay API call. Construct one per logical trace
/// (an application normally holds a single `Arc<ReplayEngine>`, but nothing
/// here is a hidden global — multiple independent engines coexist fine,
/// which is what makes the type testable).
pub struct ReplayEngine {
    mode: Mode,
    state: Mutex<EngineState>,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
    worker_pool: Option<WorkerPool>,
    external_replayer: Mutex<Option<JoinHandle<()>>>,
    /// Lets a dispatched reproducer job re-acquire the engine after it runs,
    /// to turn its soft consumption into a real one. Populated via
    /// `Arc::new_cyclic` at construction time.
    self_weak: Weak<ReplayEngine>,
}

impl ReplayEngine {
    pub fn new(prefix: &str, mode: Mode, overwrite: bool, config: EngineConfig) -> Result<Arc<Self>> {
        let mut trace = Trace::new(prefix, mode, overwrite)?;
        if mode == Mode::Replay {
            trace.coalesce();
        }

        let worker_pool = if mode == Mode::Replay { Some(WorkerPool::new(config.worker_pool_size)) } else { None };

        let engine = Arc::new_cyclic(|weak| ReplayEngine {
            mode,
            state: Mutex::new(EngineState {
                trace,
                save_restore_keys: HashSet::new(),
                thread_id_map: HashMap::new(),
                reproducers: HashMap::new(),
                kind_names: HashMap::new(),
            }),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker_pool,
            external_replayer: Mutex::new(None),
            self_weak: weak.clone(),
        });

        if mode == Mode::Replay {
            let engine_clone = Arc::clone(&engine);
            let handle = std::thread::Builder::new()
                .name("rr-external-replayer".into())
                .spawn(move || external_replayer_loop(engine_clone))
                .expect("failed to spawn external replayer thread");
            *engine.external_replayer.lock().unwrap() = Some(handle);
        }

        Ok(engine)
    }

    pub fn is_replay(&self) -> bool {
        self.mode == Mode::Replay
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    // ---- kind-name registry ----

    pub fn message_kind_name(&self, kind: i32) -> String {
        if let Some(reserved) = kinds::reserved_name(kind) {
            return reserved.to_string();
        }
        let state = self.state.lock().unwrap();
        match state.kind_names.get(&kind) {
            Some(name) => format!("UserMessage({})", name),
            None => format!("UnnamedMessageKind({})", kind),
        }
    }

    pub fn register_message_kind_name(&self, kind: i32, name: impl Into<String>) -> Result<()> {
        if kind <= kinds::MAX_RESERVED {
            return Err(TraceError::ReservedKind { kind, max_reserved: kinds::MAX_RESERVED });
        }
        self.state.lock().unwrap().kind_names.insert(kind, name.into());
        Ok(())
    }

    // ---- reproducer registry ----

    pub fn register_reproducer<F>(&self, kind: i32, reproducer: F) -> Result<()>
    where
        F: Fn(&str, &WrappedMessage) + Send + Sync + 'static,
    {
        if kind <= kinds::MAX_RESERVED {
            return Err(TraceError::ReservedKind { kind, max_reserved: kinds::MAX_RESERVED });
        }
        self.state.lock().unwrap().reproducers.insert(kind, Arc::new(reproducer));
        Ok(())
    }

    pub fn register_reproducers(&self, reproducers: HashMap<i32, Arc<ReproducerFn>>) -> Result<()> {
        for &kind in reproducers.keys() {
            if kind <= kinds::MAX_RESERVED {
                return Err(TraceError::ReservedKind { kind, max_reserved: kinds::MAX_RESERVED });
            }
        }
        self.state.lock().unwrap().reproducers.extend(reproducers);
        Ok(())
    }

    /// Called while `state` is already locked, from the SaveRestore and
    /// RecordReplay wait loops and from the external replayer thread.
    /// Returns `false` when `head.kind` has no registered reproducer, or
    /// when a prior soft consumption is already outstanding.
    fn maybe_replay_external_rpc(&self, state: &mut EngineState, head: &OpaqueEntry, head_pos: usize) -> bool {
        let reproducer = match state.reproducers.get(&head.kind) {
            Some(r) => Arc::clone(r),
            None => return false,
        };
        if !state.trace.soft_consume_head(head_pos) {
            tracing::warn!(
                pos = head_pos,
                "maybe_replay_external_rpc: callback had previously been scheduled but still is on the trace"
            );
            return false;
        }
        let connection_info = head.connection_info.clone();
        let message = head
            .payload
            .as_message()
            .cloned()
            .unwrap_or_else(|| WrappedMessage::new("", Vec::new()));
        let engine_weak = self.self_weak.clone();
        if let Some(pool) = &self.worker_pool {
            pool.dispatch(Box::new(move || {
                reproducer(&connection_info, &message);
                // The callback ran; turn the soft consumption into a real
                // one so the trace cursor advances past this entry.
                if let Some(engine) = engine_weak.upgrade() {
                    let mut state = engine.state.lock().unwrap();
                    if let Err(e) = state.trace.consume_head(head_pos) {
                        tracing::error!(error = %e, pos = head_pos, "failed to finalize externally replayed entry");
                    }
                }
            }));
        }
        true
    }

    // ---- SaveRestore family ----

    fn save_restore_internal(&self, key: &str, mut slot: SaveRestoreSlot<'_>, bail_after: Option<u32>) -> Result<i64> {
        match self.mode {
            Mode::Record => {
                let mut state = self.state.lock().unwrap();
                if state.save_restore_keys.contains(key) {
                    tracing::warn!(key, "SaveRestore: key already saved");
                }
                state.save_restore_keys.insert(key.to_string());

                let payload = match &slot {
                    SaveRestoreSlot::Message(m) => EntryPayload::Message((*m).clone()),
                    SaveRestoreSlot::Bytes(b) => {
                        if is_printable_ascii(b) {
                            EntryPayload::Str(String::from_utf8(b.to_vec()).expect("checked ascii above"))
                        } else {
                            EntryPayload::Bytes(b.to_vec())
                        }
                    }
                    SaveRestoreSlot::Num(n) => EntryPayload::Num(**n),
                };
                let entry = OpaqueEntry::new(kinds::SAVE_RESTORE, key).with_payload(payload);
                let pos = state.trace.record(entry)?;
                Ok(pos as i64)
            }
            Mode::Replay => {
                let mut remaining = bail_after;
                let mut attempts: u32 = 0;
                loop {
                    let mut state = self.state.lock().unwrap();
                    let (head, pos) = state.trace.peek_next()?;
                    let is_match = head.kind == kinds::SAVE_RESTORE && head.rr_debug_string == key;

                    if !is_match {
                        if let Some(r) = remaining {
                            if r == 0 {
                                return Ok(-1);
                            }
                            remaining = Some(r - 1);
                        }
                        let head = head.clone();
                        tracing::warn!(
                            pos,
                            key,
                            head_kind = head.kind,
                            head_key = %head.rr_debug_string,
                            "SaveRestore: head does not match"
                        );
                        self.maybe_replay_external_rpc(&mut state, &head, pos);
                        drop(state);

                        attempts += 1;
                        if attempts >= self.config.max_attempts {
                            return Err(TraceError::Divergence {
                                key: key.to_string(),
                                attempts,
                                backtrace: capture_backtrace(),
                            });
                        }
                        std::thread::sleep(self.config.save_restore_backoff);
                        continue;
                    }

                    recover_slot(head, &mut slot)?;
                    state.trace.consume_head(pos)?;
                    tracing::debug!(pos, key, "SaveRestore: restored");
                    return Ok(pos as i64);
                }
            }
        }
    }

    pub fn save_restore_message(&self, key: &str, value: &mut WrappedMessage) -> Result<i64> {
        self.save_restore_internal(key, SaveRestoreSlot::Message(value), None)
    }

    pub fn save_restore_bytes(&self, key: &str, value: &mut Vec<u8>) -> Result<i64> {
        self.save_restore_internal(key, SaveRestoreSlot::Bytes(value), None)
    }

    pub fn save_restore_str(&self, key: &str, value: &mut String) -> Result<i64> {
        let mut bytes = std::mem::take(value).into_bytes();
        let pos = self.save_restore_internal(key, SaveRestoreSlot::Bytes(&mut bytes), None)?;
        *value = String::from_utf8(bytes)
            .map_err(|e| TraceError::Corrupted { parsed: 0, reason: format!("save_restore_str: recovered bytes are not UTF-8: {}", e) })?;
        Ok(pos)
    }

    pub fn save_restore_u64(&self, key: &str, value: &mut u64) -> Result<i64> {
        self.save_restore_internal(key, SaveRestoreSlot::Num(value), None)
    }

    /// Lossless convenience wrapper: the two's-complement bit pattern of
    /// `value` round-trips through the `u64` on-disk representation exactly.
    pub fn save_restore_i64(&self, key: &str, value: &mut i64) -> Result<i64> {
        let mut as_u64 = *value as u64;
        let pos = self.save_restore_internal(key, SaveRestoreSlot::Num(&mut as_u64), None)?;
        *value = as_u64 as i64;
        Ok(pos)
    }

    pub fn maybe_save_restore_u64(&self, key: &str, value: &mut u64, bail_after: u32) -> Result<i64> {
        self.save_restore_internal(key, SaveRestoreSlot::Num(value), Some(bail_after))
    }

    // ---- per-thread SaveRestore ----

    pub fn register_thread_for_save_restore(&self, key: &str, tid_live: u64) -> Result<i64> {
        {
            let mut state = self.state.lock().unwrap();
            if state.thread_id_map.contains_key(&tid_live) {
                return Err(TraceError::DuplicateRegistration { tid: tid_live });
            }
            state.thread_id_map.insert(tid_live, tid_live);
        }

        let mut tid_value = tid_live;
        let pos = self.save_restore_internal(key, SaveRestoreSlot::Num(&mut tid_value), None)?;

        if self.mode == Mode::Replay {
            self.state.lock().unwrap().thread_id_map.insert(tid_live, tid_value);
        }
        Ok(pos)
    }

    pub fn save_restore_per_thread(
        &self,
        tid_live: u64,
        value: &mut u64,
        debug_string: &str,
        optional: bool,
        bail_after: Option<u32>,
    ) -> Result<i64> {
        if bail_after.is_some() && optional {
            return Err(TraceError::BailAfterWithOptional);
        }

        let tid_on_trace = {
            let state = self.state.lock().unwrap();
            match state.thread_id_map.get(&tid_live) {
                Some(&tid) => tid,
                None if optional => return Ok(-1),
                None => return Err(TraceError::UnregisteredThread { tid: tid_live }),
            }
        };

        let current_name = std::thread::current().name().unwrap_or("").to_string();
        if (self.config.thread_short_circuit)(&current_name) {
            return Ok(-1);
        }

        let key = format!("PerThreadSaveRestore_{}_{}", debug_string, tid_on_trace);
        self.save_restore_internal(key.as_str(), SaveRestoreSlot::Num(value), bail_after)
    }

    // ---- RecordReplay family ----

    pub fn record_replay(
        &self,
        key: &str,
        connection_info: &str,
        message: &WrappedMessage,
        kind: i32,
    ) -> Result<i64> {
        let kind = if kind == 0 { kinds::DEFAULT } else { kind };

        match self.mode {
            Mode::Record => {
                let mut state = self.state.lock().unwrap();
                let entry = OpaqueEntry::new(kind, key)
                    .with_connection_info(connection_info)
                    .with_payload(EntryPayload::Message(message.clone()));
                let pos = state.trace.record(entry)?;
                Ok(pos as i64)
            }
            Mode::Replay => {
                let mut attempts: u32 = 0;
                loop {
                    let mut state = self.state.lock().unwrap();
                    let (head, pos) = state.trace.peek_next()?;
                    let head = head.clone();

                    let mismatch = record_replay_mismatch(&head, key, connection_info, kind, message, self.config.comparator.as_ref());

                    match mismatch {
                        None => {
                            state.trace.consume_head(pos)?;
                            tracing::debug!(pos, key, "RecordReplay: replayed");
                            return Ok(pos as i64);
                        }
                        Some(reason) => {
                            attempts += 1;
                            if attempts >= self.config.warn_escalation_threshold {
                                tracing::error!(pos, key, attempts, %reason, "RecordReplay: mismatch");
                            } else {
                                tracing::warn!(pos, key, attempts, %reason, "RecordReplay: mismatch");
                            }
                            if attempts >= self.config.max_attempts {
                                return Err(TraceError::Divergence {
                                    key: key.to_string(),
                                    attempts,
                                    backtrace: capture_backtrace(),
                                });
                            }
                            self.maybe_replay_external_rpc(&mut state, &head, pos);
                            drop(state);
                            std::thread::sleep(self.config.record_replay_backoff);
                            continue;
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.external_replayer.lock().unwrap().take() {
            let _ = handle.join();
        }
        // worker_pool and state (and its Trace) are dropped by their own
        // Drop impls once this struct's fields are torn down.
    }
}

/// Sets the raw OS-level thread name (the kernel's 16-byte `comm` field, as
/// seen by `top -H`/`ps -L`), in addition to the `std::thread::Builder` name
/// already visible to `std::thread::current().name()`. Mirrors the
/// original's use of the same Linux facility.
#[cfg(target_os = "linux")]
fn set_os_thread_name(name: &str) {
    use std::ffi::CString;
    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = CString::new(truncated) {
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_os_thread_name(_name: &str) {}

fn external_replayer_loop(engine: Arc<ReplayEngine>) {
    set_os_thread_name("rr-ext-replay");
    loop {
        if engine.shutdown.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = engine.state.lock().unwrap();
            if !state.trace.has_next() {
                tracing::info!("external replayer reached end of the trace");
                return;
            }
            let (head, pos) = match state.trace.peek_next() {
                Ok(v) => v,
                Err(_) => return,
            };
            let head = head.clone();
            let replayed = engine.maybe_replay_external_rpc(&mut state, &head, pos);
            tracing::debug!(pos, replayed, "external replayer loop");
        }
        std::thread::sleep(engine.config.external_replayer_interval);
    }
}

fn recover_slot(head: &OpaqueEntry, slot: &mut SaveRestoreSlot<'_>) -> Result<()> {
    match (&head.payload, slot) {
        (EntryPayload::Str(s), SaveRestoreSlot::Bytes(out)) => {
            **out = s.clone().into_bytes();
            Ok(())
        }
        (EntryPayload::Bytes(b), SaveRestoreSlot::Bytes(out)) => {
            **out = b.clone();
            Ok(())
        }
        (EntryPayload::Num(n), SaveRestoreSlot::Num(out)) => {
            **out = *n;
            Ok(())
        }
        (EntryPayload::Message(m), SaveRestoreSlot::Message(out)) => {
            **out = m.clone();
            Ok(())
        }
        _ => Err(TraceError::MultipleValuePointers),
    }
}

#[allow(clippy::too_many_arguments)]
fn record_replay_mismatch(
    head: &OpaqueEntry,
    key: &str,
    connection_info: &str,
    kind: i32,
    message: &WrappedMessage,
    comparator: &dyn MessageComparator,
) -> Option<String> {
    if head.kind != kind {
        return Some(format!("kind mismatch: expected {} got {}", kind, head.kind));
    }
    if head.rr_debug_string != key {
        return Some(format!("key mismatch: expected {:?} got {:?}", key, head.rr_debug_string));
    }
    if head.connection_info != connection_info {
        return Some(format!(
            "connection_info mismatch: expected {:?} got {:?}",
            connection_info, head.connection_info
        ));
    }

    let head_message = head.payload.as_message();
    let bytes_match = match head_message {
        Some(m) => m.value == message.value && m.type_name == message.type_name,
        None => message.value.is_empty(),
    };
    if bytes_match {
        return None;
    }

    let head_message = head_message.cloned().unwrap_or_else(|| WrappedMessage::new("", Vec::new()));
    match comparator.compare(message, &head_message) {
        CompareOutcome::Equal | CompareOutcome::FalseAlarm => None,
        CompareOutcome::Diff(diff) => Some(format!("payload mismatch: {}", diff)),
    }
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| (b as i8) >= 0)
}

fn capture_backtrace() -> String {
    std::backtrace::Backtrace::force_capture().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::tempdir;

    /// A `tracing::Subscriber` that records each event's `message` field, so
    /// tests can assert on a specific `tracing::warn!`/`error!` without
    /// pulling in a formatting crate just to grep its output.
    struct RecordingSubscriber {
        messages: Arc<Mutex<Vec<String>>>,
    }

    impl tracing::Subscriber for RecordingSubscriber {
        fn enabled(&self, _metadata: &tracing::Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _span: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }
        fn record(&self, _span: &tracing::span::Id, _values: &tracing::span::Record<'_>) {}
        fn record_follows_from(&self, _span: &tracing::span::Id, _follows: &tracing::span::Id) {}
        fn event(&self, event: &tracing::Event<'_>) {
            struct MessageVisitor(String);
            impl tracing::field::Visit for MessageVisitor {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                    if field.name() == "message" {
                        self.0 = format!("{:?}", value);
                    }
                }
            }
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.messages.lock().unwrap().push(visitor.0);
        }
        fn enter(&self, _span: &tracing::span::Id) {}
        fn exit(&self, _span: &tracing::span::Id) {}
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            save_restore_backoff: Duration::from_millis(5),
            record_replay_backoff: Duration::from_millis(5),
            external_replayer_interval: Duration::from_millis(10),
            max_attempts: 400,
            warn_escalation_threshold: 20,
            worker_pool_size: 2,
            ..EngineConfig::default()
        }
    }

    fn prefix(dir: &std::path::Path, name: &str) -> String {
        dir.join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn save_restore_string_round_trip() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let mut s = "hello".to_string();
            let pos = engine.save_restore_str("k", &mut s).unwrap();
            assert_eq!(pos, 0);
        }
        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap();
        let mut s = String::new();
        let pos = engine.save_restore_str("k", &mut s).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(s, "hello");
    }

    #[test]
    fn save_restore_nonascii_bytes_round_trip() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let mut b = vec![0x00u8, 0xFF, 0x10];
            engine.save_restore_bytes("k", &mut b).unwrap();
        }
        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap();
        let mut b = Vec::new();
        engine.save_restore_bytes("k", &mut b).unwrap();
        assert_eq!(b, vec![0x00, 0xFF, 0x10]);
    }

    #[test]
    fn bail_after_zero_returns_minus_one_without_sleeping() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let mut v = 1u64;
            engine.save_restore_u64("other_key", &mut v).unwrap();
        }
        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap();
        let mut v = 0u64;
        let start = std::time::Instant::now();
        let pos = engine.maybe_save_restore_u64("k", &mut v, 0).unwrap();
        assert_eq!(pos, -1);
        assert!(start.elapsed() < Duration::from_millis(5));
    }

    #[test]
    fn divergence_after_max_attempts() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let mut v = 1u64;
            engine.save_restore_u64("k2", &mut v).unwrap();
        }
        let mut config = fast_config();
        config.max_attempts = 3;
        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, config).unwrap();
        let mut v = 0u64;
        let err = engine.save_restore_u64("k", &mut v).unwrap_err();
        match err {
            TraceError::Divergence { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Divergence, got {:?}", other),
        }
    }

    #[test]
    fn reserved_kinds_cannot_be_registered() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
        assert!(engine.register_reproducer(kinds::SAVE_RESTORE, |_, _| {}).is_err());
        assert!(engine.register_reproducer(kinds::MAX_RESERVED + 1, |_, _| {}).is_ok());
    }

    #[test]
    fn external_reproducer_runs_then_following_save_restore_consumes_it() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let msg = WrappedMessage::new("Inbound", vec![1, 2, 3]);
            engine.record_replay("inbound-1", "c:1#s:2", &msg, 12).unwrap();
            let mut v = 42u64;
            engine.save_restore_u64("after", &mut v).unwrap();
        }

        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        engine
            .register_reproducer(12, move |conn, msg| {
                assert_eq!(conn, "c:1#s:2");
                assert_eq!(msg.value, vec![1, 2, 3]);
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let mut v = 0u64;
        let pos = engine.save_restore_u64("after", &mut v).unwrap();
        assert_eq!(pos, 1);
        assert_eq!(v, 42);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_thread_registration_is_fatal() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
        engine.register_thread_for_save_restore("tid", 7).unwrap();
        let err = engine.register_thread_for_save_restore("tid2", 7).unwrap_err();
        assert!(matches!(err, TraceError::DuplicateRegistration { tid: 7 }));
    }

    #[test]
    fn save_restore_per_thread_optional_unregistered_returns_minus_one() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
        let mut v = 0u64;
        let pos = engine.save_restore_per_thread(99, &mut v, "dbg", true, None).unwrap();
        assert_eq!(pos, -1);
    }

    #[test]
    fn duplicate_save_restore_key_in_record_mode_warns() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();

        let messages = Arc::new(Mutex::new(Vec::new()));
        let subscriber = RecordingSubscriber { messages: Arc::clone(&messages) };
        tracing::subscriber::with_default(subscriber, || {
            let mut v1 = 1u64;
            engine.save_restore_u64("dup", &mut v1).unwrap();
            let mut v2 = 2u64;
            engine.save_restore_u64("dup", &mut v2).unwrap();
        });

        let messages = messages.lock().unwrap();
        assert!(
            messages.iter().any(|m| m.contains("already saved")),
            "expected a duplicate-key warning, got {:?}",
            messages
        );
    }

    #[test]
    fn out_of_order_multithread_replay_retries_until_match() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let msg_a = WrappedMessage::new("A", vec![1]);
            let msg_b = WrappedMessage::new("B", vec![2]);
            engine.record_replay("a", "c#s", &msg_a, 11).unwrap();
            engine.record_replay("b", "c#s", &msg_b, 11).unwrap();
        }

        // Thread B arrives first asking for key "b", which is not the head
        // (key "a" is); it must back off and retry until thread A consumes
        // "a" and the head becomes "b".
        let engine = Arc::new(ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap());
        let engine_b = Arc::clone(&engine);
        let handle_b = std::thread::spawn(move || {
            let msg_b = WrappedMessage::new("B", vec![2]);
            engine_b.record_replay("b", "c#s", &msg_b, 11).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        let msg_a = WrappedMessage::new("A", vec![1]);
        let pos_a = engine.record_replay("a", "c#s", &msg_a, 11).unwrap();
        assert_eq!(pos_a, 0);

        let pos_b = handle_b.join().unwrap();
        assert_eq!(pos_b, 1);
    }

    #[test]
    fn record_replay_false_alarm_consumes_head_without_retry() {
        let dir = tempdir().unwrap();
        let prefix = prefix(dir.path(), "t");
        {
            let engine = ReplayEngine::new(&prefix, Mode::Record, true, fast_config()).unwrap();
            let msg = WrappedMessage::new("Row", br#"{"a":1,"b":2}"#.to_vec());
            engine.record_replay("row", "c#s", &msg, 20).unwrap();
        }

        let engine = ReplayEngine::new(&prefix, Mode::Replay, false, fast_config()).unwrap();
        // Same fields, different key order: different bytes, same JSON value.
        let msg = WrappedMessage::new("Row", br#"{"b":2,"a":1}"#.to_vec());
        let start = std::time::Instant::now();
        let pos = engine.record_replay("row", "c#s", &msg, 20).unwrap();
        assert_eq!(pos, 0);
        assert!(
            start.elapsed() < Duration::from_millis(5),
            "a false alarm should consume the head on the first attempt without backing off"
        );
    }
}
