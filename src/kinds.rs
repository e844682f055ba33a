//! Reserved entry kinds and the kuduraft integration's conventional kinds.

/// Entry kind reserved for a default-constructed, never-recorded entry.
pub const INVALID: i32 = 0;
/// Entry kind used by [`crate::engine::ReplayEngine::record_replay`] when the
/// caller passes `kind = 0`.
pub const DEFAULT: i32 = 1;
/// Entry kind used by the SaveRestore family.
pub const SAVE_RESTORE: i32 = 2;
/// Highest kind reserved for internal use. User kinds must be strictly
/// greater than this.
pub const MAX_RESERVED: i32 = SAVE_RESTORE;

/// Returns the reserved label for `kind`, or `None` if `kind` is a
/// user-registered kind.
pub fn reserved_name(kind: i32) -> Option<&'static str> {
    match kind {
        INVALID => Some("Invalid"),
        DEFAULT => Some("Default"),
        SAVE_RESTORE => Some("SaveRestore"),
        _ => None,
    }
}

/// Conventional kinds used by the kuduraft integration. These are ordinary
/// user kinds as far as the core engine is concerned; they are collected
/// here purely as a naming convenience for integrators.
pub mod kudu {
    pub const OUTBOUND_REQUEST: i32 = 9;
    pub const OUTBOUND_RESPONSE: i32 = 10;
    pub const INBOUND_REQUEST: i32 = 11;
    pub const INBOUND_RESPONSE: i32 = 12;
}
