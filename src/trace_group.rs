//! [`TraceGroup`]: a narrowing set of candidate byte-stream traces believed
//! to be the same socket conversation, used by the mock socket server to
//! figure out which recording to replay against a live connection.

use crate::error::{Result, TraceError};
use crate::trace::Trace;

/// Vector of independently-advancing candidate [`Trace`]s plus an
/// intra-entry byte cursor shared across all surviving candidates.
#[derive(Default)]
pub struct TraceGroup {
    traces: Vec<Trace>,
    /// Byte offset into the current (shared) head entry's payload.
    pos: usize,
}

impl TraceGroup {
    pub fn new() -> Self {
        TraceGroup {
            traces: Vec::new(),
            pos: 0,
        }
    }

    pub fn add_trace(&mut self, trace: Trace) {
        self.traces.push(trace);
    }

    pub fn candidate_count(&self) -> usize {
        self.traces.len()
    }

    pub fn all_empty(&self) -> bool {
        self.traces.iter().all(|t| t.is_empty())
    }

    /// True iff, for every candidate, the head either has debug-string
    /// exactly `"Socket Read"` or the candidate is empty.
    pub fn next_is_read_or_empty(&self) -> bool {
        self.traces.iter().all(|t| match t.front() {
            None => true,
            Some(head) => head.is_socket_read(),
        })
    }

    /// True iff, for every non-empty candidate, the head is a socket write.
    /// Unlike `next_is_read_or_empty`, an empty candidate does *not* count
    /// as satisfying this — there must be at least one candidate, and an
    /// empty one is a mismatch (mirrors the original's `empty_is_ok = false`
    /// for the write check).
    pub fn next_is_write(&self) -> bool {
        if self.traces.is_empty() {
            return false;
        }
        self.traces.iter().all(|t| match t.front() {
            None => false,
            Some(head) => head.is_socket_write(),
        })
    }

    /// Narrows the group using `buffer` as the bytes just read off the live
    /// socket: any candidate whose head is not a matching `"Socket Read"` of
    /// at least `buffer.len()` remaining bytes at the current intra-entry
    /// offset is dropped from the group. Surviving candidates whose head is
    /// now fully consumed pop it and reset the intra-entry offset to zero;
    /// otherwise the offset advances by `buffer.len()`.
    pub fn consume_read(&mut self, buffer: &[u8]) -> Result<()> {
        let len = buffer.len();
        let mut survivors = Vec::new();
        let mut remaining_on_head: Option<usize> = None;

        for mut trace in std::mem::take(&mut self.traces) {
            let head = match trace.front() {
                None => continue, // exhausted candidates drop out of the group
                Some(h) => h,
            };
            if !head.is_socket_read() {
                tracing::info!(debug_string = %head.rr_debug_string, "TraceGroup::consume_read: head is not a Socket Read, dropping candidate");
                continue;
            }
            let remaining = head.body_size.saturating_sub(self.pos);
            if len > remaining {
                tracing::info!(len, remaining, "TraceGroup::consume_read: read longer than remaining bytes on head, dropping candidate");
                continue;
            }
            let head_bytes = head.bytes_payload().unwrap_or(&[]);
            if &head_bytes[self.pos..self.pos + len] != buffer {
                tracing::info!("TraceGroup::consume_read: byte mismatch, dropping candidate");
                continue;
            }

            match remaining_on_head {
                None => remaining_on_head = Some(remaining),
                Some(r) if r != remaining => {
                    return Err(TraceError::GroupDivergence(format!(
                        "surviving candidates disagree on remaining bytes on head: {} vs {}",
                        r, remaining
                    )));
                }
                Some(_) => {}
            }
            survivors.push(trace);
        }

        let pop_front = matches!(remaining_on_head, Some(r) if r == len);
        if pop_front {
            for trace in survivors.iter_mut() {
                let expected = trace.front().map(|h| h.body_size).unwrap_or(0);
                if expected != self.pos + len {
                    return Err(TraceError::GroupDivergence(format!(
                        "head body_size {} does not match pos+len {}",
                        expected,
                        self.pos + len
                    )));
                }
                trace.pop_front_unchecked();
            }
            self.pos = 0;
        } else {
            self.pos += len;
        }

        tracing::info!(from = survivors.len(), "TraceGroup::consume_read updated candidate set");
        self.traces = survivors;
        Ok(())
    }

    /// Requires [`Self::next_is_write`]. All candidates' heads must agree on
    /// `body_size` and bytes; the common bytes are copied into `buffer`
    /// (which must be at least as large) and every candidate's head is
    /// popped. Returns the number of bytes written.
    pub fn next_common_write(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if self.traces.is_empty() {
            return Err(TraceError::GroupDivergence("next_common_write called with no candidates".into()));
        }
        let first = self.traces[0].front().ok_or_else(|| {
            TraceError::GroupDivergence("next_common_write: first candidate trace is empty".into())
        })?;
        let msg = first.bytes_payload().unwrap_or(&[]).to_vec();
        if msg.len() != first.body_size {
            return Err(TraceError::GroupDivergence(format!(
                "write body_size {} does not match payload length {}",
                first.body_size,
                msg.len()
            )));
        }
        if msg.len() > buffer.len() {
            return Err(TraceError::GroupDivergence(format!(
                "write size {} is bigger than buffer {}",
                msg.len(),
                buffer.len()
            )));
        }

        for trace in &self.traces {
            let head = trace
                .front()
                .ok_or_else(|| TraceError::GroupDivergence("next_common_write: candidate trace is empty".into()))?;
            if !head.is_socket_write() {
                return Err(TraceError::GroupDivergence("next_common_write: head is not a write".into()));
            }
            if head.body_size != msg.len() {
                return Err(TraceError::GroupDivergence(format!(
                    "next_common_write: body_size {} != {}",
                    head.body_size,
                    msg.len()
                )));
            }
            if head.bytes_payload().unwrap_or(&[]) != msg.as_slice() {
                return Err(TraceError::GroupDivergence("next_common_write: write data differs across candidates".into()));
            }
        }

        buffer[..msg.len()].copy_from_slice(&msg);
        for trace in self.traces.iter_mut() {
            trace.pop_front_unchecked();
        }
        Ok(msg.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPayload;
    use crate::trace::Mode;
    use tempfile::tempdir;

    fn make_trace(dir: &std::path::Path, name: &str, entries: Vec<crate::entry::OpaqueEntry>) -> Trace {
        let prefix = dir.join(name).to_str().unwrap().to_string();
        {
            let mut t = Trace::new(&prefix, Mode::Record, true).unwrap();
            for e in entries {
                t.record(e).unwrap();
            }
        }
        Trace::new(&prefix, Mode::Replay, false).unwrap()
    }

    fn read_entry(debug: &str, bytes: Vec<u8>) -> crate::entry::OpaqueEntry {
        crate::entry::OpaqueEntry::new(1, debug).with_payload(EntryPayload::Bytes(bytes))
    }

    #[test]
    fn narrows_on_mismatched_read_and_agrees_on_write() {
        let dir = tempdir().unwrap();
        let a = make_trace(
            &dir.path(),
            "a",
            vec![read_entry("Socket Read", vec![1, 2, 3]), read_entry("Socket Write", vec![9, 9])],
        );
        let b = make_trace(
            &dir.path(),
            "b",
            vec![read_entry("Socket Read", vec![1, 2, 9]), read_entry("Socket Write", vec![9, 9])],
        );

        let mut group = TraceGroup::new();
        group.add_trace(a);
        group.add_trace(b);

        assert!(group.next_is_read_or_empty());
        group.consume_read(&[1, 2, 3]).unwrap();
        assert_eq!(group.candidate_count(), 1, "candidate b should have been dropped");

        assert!(group.next_is_write());
        let mut buf = [0u8; 8];
        let n = group.next_common_write(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[9, 9]);
        assert!(group.all_empty());
    }

    #[test]
    fn partial_read_advances_intra_entry_offset() {
        let dir = tempdir().unwrap();
        let a = make_trace(&dir.path(), "a", vec![read_entry("Socket Read", vec![1, 2, 3, 4])]);
        let mut group = TraceGroup::new();
        group.add_trace(a);

        group.consume_read(&[1, 2]).unwrap();
        assert_eq!(group.candidate_count(), 1);
        assert!(!group.all_empty());
        group.consume_read(&[3, 4]).unwrap();
        assert!(group.all_empty());
    }
}
