//! Length-prefixed binary serialization of [`OpaqueEntry`] plus the mirrored
//! human-readable log.
//!
//! On-disk format for the `.bin` file: a sequence of
//! `[8-byte little-endian length][bincode-encoded OpaqueEntry]` records. The
//! original uses a machine-word-sized length prefix written in native byte
//! order; this port fixes the width at 8 bytes (`u64`) and the order at
//! little-endian, since "native order" is not a meaningful portability
//! target for a from-scratch format and every platform this crate runs on is
//! little-endian.

use crate::entry::OpaqueEntry;
use crate::error::{Result, TraceError};
use std::io::{Read, Write};

const LENGTH_PREFIX_BYTES: usize = std::mem::size_of::<u64>();

/// Appends `entry` to `bin` (length-prefixed bincode) and `txt` (one
/// short-debug-string line), then flushes both. Mirrors `Trace::Record` in
/// the original, which interleaves a write to the text stream and the
/// binary stream under the same lock and flushes both before returning.
pub fn write_entry<W1: Write, W2: Write>(bin: &mut W1, txt: &mut W2, entry: &OpaqueEntry) -> Result<()> {
    let encoded = bincode::serialize(entry)?;
    let len = encoded.len() as u64;
    bin.write_all(&len.to_le_bytes())?;
    bin.write_all(&encoded)?;
    bin.flush()?;

    writeln!(txt, "{}", entry.short_debug_string())?;
    txt.flush()?;
    Ok(())
}

/// Parses every entry out of `bin` until EOF. A truncated length prefix or
/// payload is a fatal error (mirrors the original's load-time
/// `std::runtime_error`), reported with the count of entries successfully
/// parsed before the failure.
pub fn read_all_entries<R: Read>(bin: &mut R) -> Result<Vec<OpaqueEntry>> {
    let mut entries = Vec::new();
    loop {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        match read_exact_or_eof(bin, &mut len_buf)? {
            None => break,
            Some(0) => break,
            Some(n) if n < LENGTH_PREFIX_BYTES => {
                return Err(TraceError::Corrupted {
                    parsed: entries.len(),
                    reason: format!("truncated length prefix, got {} of {} bytes", n, LENGTH_PREFIX_BYTES),
                });
            }
            Some(_) => {}
        }
        let len = u64::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        bin.read_exact(&mut payload).map_err(|e| TraceError::Corrupted {
            parsed: entries.len(),
            reason: format!("truncated payload of declared length {}: {}", len, e),
        })?;
        let entry: OpaqueEntry = bincode::deserialize(&payload).map_err(|e| TraceError::Corrupted {
            parsed: entries.len(),
            reason: format!("failed to decode entry: {}", e),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Like `Read::read_exact`, but distinguishes "clean EOF before any byte was
/// read" (`Ok(None)`) from "EOF partway through" (`Ok(Some(n))` with `n` the
/// number of bytes actually read) so the caller can tell a clean end of file
/// apart from a truncated record.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<Option<usize>> {
    let mut read_so_far = 0;
    while read_so_far < buf.len() {
        match r.read(&mut buf[read_so_far..]) {
            Ok(0) => {
                return Ok(if read_so_far == 0 { None } else { Some(read_so_far) });
            }
            Ok(n) => read_so_far += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(read_so_far))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPayload;

    #[test]
    fn round_trips_a_batch_of_entries() {
        let entries = vec![
            OpaqueEntry::new(2, "k1").with_payload(EntryPayload::Str("hello".into())),
            OpaqueEntry::new(2, "k2").with_payload(EntryPayload::Bytes(vec![0, 255, 16])),
            OpaqueEntry::new(11, "k3")
                .with_connection_info("a:1#b:2")
                .with_payload(EntryPayload::Num(7)),
        ];

        let mut bin = Vec::new();
        let mut txt = Vec::new();
        for e in &entries {
            write_entry(&mut bin, &mut txt, e).unwrap();
        }

        let mut cursor = std::io::Cursor::new(bin);
        let parsed = read_all_entries(&mut cursor).unwrap();
        assert_eq!(parsed, entries);

        let txt = String::from_utf8(txt).unwrap();
        assert_eq!(txt.lines().count(), 3);
    }

    #[test]
    fn truncated_payload_reports_parsed_count() {
        let entries = vec![
            OpaqueEntry::new(2, "k1").with_payload(EntryPayload::Num(1)),
            OpaqueEntry::new(2, "k2").with_payload(EntryPayload::Num(2)),
        ];
        let mut bin = Vec::new();
        let mut txt = Vec::new();
        for e in &entries {
            write_entry(&mut bin, &mut txt, e).unwrap();
        }
        bin.truncate(bin.len() - 2);

        let mut cursor = std::io::Cursor::new(bin);
        let err = read_all_entries(&mut cursor).unwrap_err();
        match err {
            TraceError::Corrupted { parsed, .. } => assert_eq!(parsed, 1),
            other => panic!("expected Corrupted, got {:?}", other),
        }
    }
}
