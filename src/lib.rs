//! A deterministic record-and-replay library for distributed processes.
//!
//! An application links this crate, constructs one [`engine::ReplayEngine`]
//! per logical trace, and routes its nondeterministic interactions —
//! incoming/outgoing RPCs, externally observable state, raw socket traffic —
//! through it. In record mode those interactions are appended to a trace
//! file; in replay mode the same call sequence is matched against that
//! trace, and any divergence is surfaced rather than silently tolerated.

pub mod codec;
pub mod compare;
pub mod engine;
pub mod entry;
pub mod error;
pub mod kinds;
pub mod mock_server;
pub mod socket;
pub mod trace;
pub mod trace_group;

pub use compare::{CompareOutcome, JsonValueComparator, MessageComparator, PROTO_COMPARE_FALSE_ALARM};
pub use engine::{EngineConfig, ReplayEngine, SaveRestoreSlot};
pub use entry::{EntryPayload, OpaqueEntry, WrappedMessage};
pub use error::{Result, TraceError};
pub use mock_server::{send_traffic, MockServer};
pub use trace::{Mode, Trace};
pub use trace_group::TraceGroup;
