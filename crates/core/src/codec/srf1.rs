//! SRF1 snapshot chunk codec.
//!
//! A chunk is an optionally gzip-compressed byte stream (sniffed by the
//! `1f 8b` magic) around a frame stream: the 4-byte ASCII magic `SRF1`
//! once at the start, then repeated `{u32 big-endian length, UTF-8 JSON
//! object}` frames. No trailer.
//!
//! Integrity is verified over the bytes as they arrive from the transport
//! (the gzip envelope when compressed): the raw reader is teed into a
//! sha-256 sink before any decompression.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tidesync_domain::{Result, TidesyncError};

/// Frame-stream magic.
pub const SRF1_MAGIC: [u8; 4] = *b"SRF1";

/// Gzip envelope magic.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Upper bound on a single frame payload. Anything larger is a corrupt
/// length header, not a row.
const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

/// Reader tee that hashes every byte passing through it.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, hasher: Sha256::new() }
    }

    fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Decode one chunk, invoking `on_row` for every decoded row in order.
///
/// When `expected_sha256` is given, the digest over the raw transport bytes
/// is compared after the stream is fully consumed; a mismatch raises
/// [`TidesyncError::ChunkIntegrity`]. Returns the number of rows decoded.
pub fn decode_chunk<R, F>(reader: R, expected_sha256: Option<&str>, on_row: F) -> Result<usize>
where
    R: Read,
    F: FnMut(Value) -> Result<()>,
{
    let mut tee = HashingReader::new(reader);

    // Sniff the first two bytes for the gzip envelope; they stay part of
    // the hashed and parsed stream.
    let mut head = [0u8; 2];
    let head_len = read_up_to(&mut tee, &mut head)?;

    let rows;
    let tee = if head_len == 2 && head == GZIP_MAGIC {
        let chained = Cursor::new(head.to_vec()).chain(tee);
        let mut decoder = GzDecoder::new(chained);
        rows = read_frames(&mut decoder, on_row)?;
        let (_, tee) = decoder.into_inner().into_inner();
        tee
    } else {
        let mut chained = Cursor::new(head[..head_len].to_vec()).chain(tee);
        rows = read_frames(&mut chained, on_row)?;
        let (_, tee) = chained.into_inner();
        tee
    };

    // Drain anything the frame parser did not consume so the digest covers
    // the complete transport payload.
    let mut tee = tee;
    std::io::copy(&mut tee, &mut std::io::sink())
        .map_err(|e| decode_error("draining chunk stream", &e))?;

    if let Some(expected) = expected_sha256 {
        let actual = tee.finalize_hex();
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(TidesyncError::ChunkIntegrity(format!(
                "chunk digest mismatch: expected {expected}, computed {actual}"
            )));
        }
    }

    Ok(rows)
}

/// Parse a decompressed SRF1 frame stream.
pub fn read_frames<R, F>(reader: &mut R, mut on_row: F) -> Result<usize>
where
    R: Read,
    F: FnMut(Value) -> Result<()>,
{
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| decode_error("reading SRF1 magic", &e))?;
    if magic != SRF1_MAGIC {
        return Err(TidesyncError::SnapshotDecode(format!(
            "missing SRF1 magic at start of chunk (got {:02x?})",
            magic
        )));
    }

    let mut rows = 0usize;
    loop {
        let len = match read_frame_len(reader)? {
            Some(len) => len,
            None => break,
        };
        if len > MAX_FRAME_LEN {
            return Err(TidesyncError::SnapshotDecode(format!(
                "frame length {len} exceeds limit"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .map_err(|e| decode_error("reading frame payload", &e))?;

        let value: Value = serde_json::from_slice(&payload).map_err(|e| {
            TidesyncError::SnapshotDecode(format!("frame payload is not valid JSON: {e}"))
        })?;
        if !value.is_object() {
            return Err(TidesyncError::SnapshotDecode(
                "frame payload is not a JSON object".into(),
            ));
        }

        on_row(value)?;
        rows += 1;
    }

    Ok(rows)
}

/// Read a 4-byte big-endian frame length. `None` at a clean end of stream;
/// an error if the stream ends inside the header.
fn read_frame_len<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0usize;
    while filled < 4 {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| decode_error("reading frame header", &e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TidesyncError::SnapshotDecode(
                "stream truncated inside frame header".into(),
            ));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| decode_error("reading chunk head", &e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn decode_error(context: &str, err: &std::io::Error) -> TidesyncError {
    TidesyncError::SnapshotDecode(format!("{context}: {err}"))
}

/// Encode rows as an SRF1 frame stream (test servers and tooling).
pub fn encode_frames(rows: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&SRF1_MAGIC);
    for row in rows {
        let payload = row.to_string().into_bytes();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
    }
    out
}

/// Accumulates rows into batches of at most `limit`.
///
/// A full batch is handed back only when a further row arrives, so the
/// final flush (at end of the whole snapshot, across chunks) is never
/// empty unless the snapshot itself held no rows.
#[derive(Debug)]
pub struct SnapshotBatcher {
    limit: usize,
    pending: Vec<Value>,
}

impl SnapshotBatcher {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1), pending: Vec::new() }
    }

    /// Add a row. Returns a full batch to flush (as a non-final batch)
    /// when the pending buffer overflows.
    pub fn push(&mut self, row: Value) -> Option<Vec<Value>> {
        if self.pending.len() == self.limit {
            let batch = std::mem::take(&mut self.pending);
            self.pending.push(row);
            Some(batch)
        } else {
            self.pending.push(row);
            None
        }
    }

    /// Take the final batch. May be empty only for an empty snapshot.
    pub fn finish(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;

    use super::*;

    fn rows(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": i.to_string(), "name": format!("row-{i}")})).collect()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    #[test]
    fn decodes_plain_frames() {
        let encoded = encode_frames(&rows(3));
        let mut seen = Vec::new();
        let count = decode_chunk(encoded.as_slice(), None, |row| {
            seen.push(row);
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 3);
        assert_eq!(seen[0]["id"], "0");
        assert_eq!(seen[2]["name"], "row-2");
    }

    #[test]
    fn decodes_gzip_frames_and_verifies_envelope_digest() {
        let encoded = encode_frames(&rows(5));
        let compressed = gzip(&encoded);
        let digest = sha256_hex(&compressed);

        let mut seen = 0usize;
        let count = decode_chunk(compressed.as_slice(), Some(&digest), |_| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 5);
        assert_eq!(seen, 5);
    }

    #[test]
    fn digest_is_over_transport_bytes_not_decompressed_payload() {
        let encoded = encode_frames(&rows(2));
        let compressed = gzip(&encoded);
        let wrong = sha256_hex(&encoded); // digest of the decompressed bytes

        let err = decode_chunk(compressed.as_slice(), Some(&wrong), |_| Ok(())).unwrap_err();
        assert!(matches!(err, TidesyncError::ChunkIntegrity(_)));

        let right = sha256_hex(&compressed);
        assert!(decode_chunk(compressed.as_slice(), Some(&right), |_| Ok(())).is_ok());
    }

    #[test]
    fn digest_mismatch_fails_plain_chunks_too() {
        let encoded = encode_frames(&rows(1));
        let err = decode_chunk(encoded.as_slice(), Some("deadbeef"), |_| Ok(())).unwrap_err();
        assert!(matches!(err, TidesyncError::ChunkIntegrity(_)));
    }

    #[test]
    fn missing_magic_is_rejected() {
        let mut bad = encode_frames(&rows(1));
        bad[0] = b'X';
        let err = decode_chunk(bad.as_slice(), None, |_| Ok(())).unwrap_err();
        assert!(matches!(err, TidesyncError::SnapshotDecode(_)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut encoded = encode_frames(&rows(2));
        encoded.truncate(encoded.len() - 3);
        let err = decode_chunk(encoded.as_slice(), None, |_| Ok(())).unwrap_err();
        assert!(matches!(err, TidesyncError::SnapshotDecode(_)));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let encoded = encode_frames(&[json!([1, 2, 3])]);
        let err = decode_chunk(encoded.as_slice(), None, |_| Ok(())).unwrap_err();
        assert!(matches!(err, TidesyncError::SnapshotDecode(_)));
    }

    #[test]
    fn row_callback_errors_propagate() {
        let encoded = encode_frames(&rows(2));
        let err = decode_chunk(encoded.as_slice(), None, |_| {
            Err(TidesyncError::Handler("no room".into()))
        })
        .unwrap_err();
        assert!(matches!(err, TidesyncError::Handler(_)));
    }

    #[test]
    fn empty_frame_stream_decodes_to_zero_rows() {
        let encoded = encode_frames(&[]);
        let count = decode_chunk(encoded.as_slice(), None, |_| Ok(())).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn batcher_overflow_keeps_final_batch_nonempty() {
        let mut batcher = SnapshotBatcher::new(2);
        assert!(batcher.push(json!({"i": 1})).is_none());
        assert!(batcher.push(json!({"i": 2})).is_none());

        // Third row overflows: the first two flush, the third stays pending.
        let flushed = batcher.push(json!({"i": 3})).unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(batcher.pending_len(), 1);

        let last = batcher.finish();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0]["i"], 3);
    }

    #[test]
    fn batcher_exact_multiple_flushes_once_at_finish() {
        let mut batcher = SnapshotBatcher::new(2);
        for i in 0..4 {
            if let Some(batch) = batcher.push(json!({"i": i})) {
                assert_eq!(batch.len(), 2);
            }
        }
        // Four rows, limit two: one overflow flush happened, the final two
        // rows come out of finish().
        let last = batcher.finish();
        assert_eq!(last.len(), 2);
    }
}
