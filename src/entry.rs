//! The sole trace record: [`OpaqueEntry`].

use serde::{Deserialize, Serialize};

/// A structured-message payload, opaque to the core engine. The core never
/// inspects the bytes beyond equality comparison and the comparator hook in
/// [`crate::compare`]; the schema lives entirely in the host application.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrappedMessage {
    /// A schema identifier, analogous to a protobuf `Any`'s `type_url`.
    pub type_name: String,
    /// The encoded payload bytes.
    pub value: Vec<u8>,
}

impl WrappedMessage {
    pub fn new(type_name: impl Into<String>, value: Vec<u8>) -> Self {
        WrappedMessage {
            type_name: type_name.into(),
            value,
        }
    }
}

/// Exactly one of these is ever populated on an [`OpaqueEntry`]. Modeling the
/// "exactly one of four optional fields" invariant from the original as an
/// enum makes the invariant a type-level fact rather than something asserted
/// at each call site.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryPayload {
    Empty,
    Message(WrappedMessage),
    Str(String),
    Bytes(Vec<u8>),
    Num(u64),
}

impl EntryPayload {
    pub fn is_empty(&self) -> bool {
        matches!(self, EntryPayload::Empty)
    }

    pub fn as_message(&self) -> Option<&WrappedMessage> {
        match self {
            EntryPayload::Message(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntryPayload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            EntryPayload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<u64> {
        match self {
            EntryPayload::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Length used for `body_size` bookkeeping and socket-byte coalescing.
    pub fn byte_len(&self) -> usize {
        match self {
            EntryPayload::Empty => 0,
            EntryPayload::Message(m) => m.value.len(),
            EntryPayload::Str(s) => s.len(),
            EntryPayload::Bytes(b) => b.len(),
            EntryPayload::Num(_) => 8,
        }
    }
}

/// One record of the trace.
///
/// Fields mirror the original `OpequeEntry` protobuf message: `kind` is a
/// small integer tag (see [`crate::kinds`]), `rr_debug_string` doubles as a
/// human-readable label and a structural-matching key, `connection_info`
/// identifies the RPC originator/peer (`client_host:client_port#server_host:
/// server_port`), and `link_to_token` optionally cross-references a prior
/// entry's position for request/response pairing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpaqueEntry {
    pub kind: i32,
    pub rr_debug_string: String,
    pub connection_info: String,
    pub link_to_token: Option<usize>,
    pub body_size: usize,
    pub payload: EntryPayload,
}

impl OpaqueEntry {
    pub fn new(kind: i32, rr_debug_string: impl Into<String>) -> Self {
        OpaqueEntry {
            kind,
            rr_debug_string: rr_debug_string.into(),
            connection_info: String::new(),
            link_to_token: None,
            body_size: 0,
            payload: EntryPayload::Empty,
        }
    }

    pub fn with_payload(mut self, payload: EntryPayload) -> Self {
        self.body_size = payload.byte_len();
        self.payload = payload;
        self
    }

    pub fn with_connection_info(mut self, connection_info: impl Into<String>) -> Self {
        self.connection_info = connection_info.into();
        self
    }

    pub fn with_link_to_token(mut self, token: usize) -> Self {
        self.link_to_token = Some(token);
        self
    }

    /// Compact one-line rendering used for the mirrored `.txt` trace file and
    /// for log messages. Intentionally terser than a full `serde_json`
    /// rendering (analogous to the original's `ShortDebugString`).
    pub fn short_debug_string(&self) -> String {
        let payload = match &self.payload {
            EntryPayload::Empty => "empty".to_string(),
            EntryPayload::Message(m) => format!("message<{}>[{}B]", m.type_name, m.value.len()),
            EntryPayload::Str(s) => format!("str({:?})", s),
            EntryPayload::Bytes(b) => format!("bytes[{}]", b.len()),
            EntryPayload::Num(n) => format!("num({})", n),
        };
        format!(
            "kind={} key={:?} conn={:?} link={:?} size={} payload={}",
            self.kind, self.rr_debug_string, self.connection_info, self.link_to_token,
            self.body_size, payload
        )
    }

    /// True if `rr_debug_string` is exactly `"Socket Read"`.
    pub fn is_socket_read(&self) -> bool {
        self.rr_debug_string == "Socket Read"
    }

    /// True if `rr_debug_string` is `"Socket Write"` or begins with
    /// `"Socket writev of"`.
    pub fn is_socket_write(&self) -> bool {
        self.rr_debug_string == "Socket Write" || self.rr_debug_string.starts_with("Socket writev of")
    }

    pub fn bytes_payload(&self) -> Option<&[u8]> {
        self.payload.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_payload_variant_at_a_time() {
        let e = OpaqueEntry::new(1, "k").with_payload(EntryPayload::Num(42));
        assert_eq!(e.payload.as_num(), Some(42));
        assert!(e.payload.as_str().is_none());
        assert!(e.payload.as_bytes().is_none());
        assert!(e.payload.as_message().is_none());
        assert_eq!(e.body_size, 8);
    }

    #[test]
    fn socket_write_prefix_match() {
        let e = OpaqueEntry::new(1, "Socket writev of 3 buffers");
        assert!(e.is_socket_write());
        assert!(!e.is_socket_read());
    }
}
