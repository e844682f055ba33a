//! [`TraceError`], the crate's single error hierarchy.
//!
//! The original aborts the host process (`assert`/`DCHECK`/`throw`) for
//! every one of these situations. A library should not do that on behalf of
//! its host, so each of these is instead surfaced as a `Result::Err`; a
//! caller that wants the original's fail-fast behavior gets it for free via
//! `.unwrap()` or `.expect(..)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("kind {kind} is reserved for internal use; use kinds larger than {max_reserved}")]
    ReservedKind { kind: i32, max_reserved: i32 },

    #[error("save_restore called with more than one value pointer populated")]
    MultipleValuePointers,

    #[error("thread {tid} was already registered for save/restore")]
    DuplicateRegistration { tid: u64 },

    #[error("save_restore_per_thread called with bail_after != -1 and optional = true")]
    BailAfterWithOptional,

    #[error("thread {tid} is not registered for save/restore and optional = false")]
    UnregisteredThread { tid: u64 },

    #[error("trace is empty (end of trace reached while the application expected more)")]
    UnexpectedEof,

    #[error("trace file is corrupted; parsed {parsed} entries before failure: {reason}")]
    Corrupted { parsed: usize, reason: String },

    #[error("malformed connection_info {0:?}, expected \"<client_host>:<client_port>#<server_host>:<server_port>\"")]
    MalformedConnectionInfo(String),

    #[error(
        "replay diverged: {attempts} attempts to match key {key:?} exceeded the bound\n{backtrace}"
    )]
    Divergence {
        key: String,
        attempts: u32,
        backtrace: String,
    },

    #[error("trace group diverged: {0}")]
    GroupDivergence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("bincode encode/decode failure: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;
