//! Record stream reading and writing
//!
//! A dump file is a bare sequence of records with no header or footer.
//! Each record is, big-endian:
//!
//! ```text
//! key_len: u32 | key | ttl_ms: i64 | snapshot_len: u32 | snapshot
//! ```
//!
//! End of input at a record boundary ends the stream. End of input anywhere
//! else is a [`RecordError::Truncated`].

use crate::error::RecordError;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// One key as captured by a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Raw key bytes, not necessarily UTF-8
    pub key: Vec<u8>,
    /// Remaining time to live in milliseconds, 0 for no expiration
    pub ttl_ms: i64,
    /// Opaque native serialization produced by the store
    pub snapshot: Vec<u8>,
}

/// Append one record to `writer`.
///
/// Negative TTLs are written as 0.
pub async fn write_record<W>(
    writer: &mut W,
    key: &[u8],
    ttl_ms: i64,
    snapshot: &[u8],
) -> Result<(), RecordError>
where
    W: AsyncWrite + Unpin,
{
    let key_len = length_prefix("key", key.len())?;
    let snapshot_len = length_prefix("snapshot", snapshot.len())?;

    writer.write_u32(key_len).await?;
    writer.write_all(key).await?;
    writer.write_i64(ttl_ms.max(0)).await?;
    writer.write_u32(snapshot_len).await?;
    writer.write_all(snapshot).await?;

    Ok(())
}

/// Read the next record from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly at a record boundary.
pub async fn read_record<R>(reader: &mut R) -> Result<Option<Record>, RecordError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let filled = fill(reader, &mut len_buf).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < len_buf.len() {
        return Err(RecordError::Truncated {
            field: "key length",
            expected: 4,
            actual: filled as u64,
        });
    }
    let key_len = u32::from_be_bytes(len_buf);
    let key = read_bytes(reader, "key", key_len).await?;

    let mut ttl_buf = [0u8; 8];
    read_fixed(reader, "ttl", &mut ttl_buf).await?;
    let ttl_ms = i64::from_be_bytes(ttl_buf);

    read_fixed(reader, "snapshot length", &mut len_buf).await?;
    let snapshot_len = u32::from_be_bytes(len_buf);
    let snapshot = read_bytes(reader, "snapshot", snapshot_len).await?;

    Ok(Some(Record {
        key,
        ttl_ms,
        snapshot,
    }))
}

/// Summary of a record stream on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub records: u64,
    pub records_with_ttl: u64,
    pub key_bytes: u64,
    pub snapshot_bytes: u64,
}

/// Decode a whole dump file without touching any cluster.
pub async fn inspect_stream(path: &Path) -> Result<StreamStats, RecordError> {
    info!("Inspecting record stream {:?}", path);

    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut stats = StreamStats::default();

    while let Some(record) = read_record(&mut reader).await? {
        stats.records += 1;
        stats.key_bytes += record.key.len() as u64;
        stats.snapshot_bytes += record.snapshot.len() as u64;
        if record.ttl_ms > 0 {
            stats.records_with_ttl += 1;
        }
    }

    debug!("Stream holds {} records", stats.records);
    Ok(stats)
}

fn length_prefix(field: &'static str, len: usize) -> Result<u32, RecordError> {
    u32::try_from(len).map_err(|_| RecordError::TooLarge { field, len })
}

/// Read until `buf` is full or input ends, returning the bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, RecordError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_fixed<R>(
    reader: &mut R,
    field: &'static str,
    buf: &mut [u8],
) -> Result<(), RecordError>
where
    R: AsyncRead + Unpin,
{
    let filled = fill(reader, buf).await?;
    if filled < buf.len() {
        return Err(RecordError::Truncated {
            field,
            expected: buf.len() as u64,
            actual: filled as u64,
        });
    }
    Ok(())
}

// Reads through `take` so a corrupt length cannot force a huge allocation up front.
async fn read_bytes<R>(
    reader: &mut R,
    field: &'static str,
    len: u32,
) -> Result<Vec<u8>, RecordError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    (&mut *reader)
        .take(u64::from(len))
        .read_to_end(&mut bytes)
        .await?;

    if bytes.len() as u64 != u64::from(len) {
        return Err(RecordError::Truncated {
            field,
            expected: u64::from(len),
            actual: bytes.len() as u64,
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn encode(records: &[Record]) -> Vec<u8> {
        let mut buf = Vec::new();
        for record in records {
            write_record(&mut buf, &record.key, record.ttl_ms, &record.snapshot)
                .await
                .unwrap();
        }
        buf
    }

    async fn decode_all(bytes: &[u8]) -> Result<Vec<Record>, RecordError> {
        let mut reader = Cursor::new(bytes.to_vec());
        let mut records = Vec::new();
        while let Some(record) = read_record(&mut reader).await? {
            records.push(record);
        }
        Ok(records)
    }

    fn sample_records() -> Vec<Record> {
        let every_byte: Vec<u8> = (0..=255u8).collect();
        vec![
            Record {
                key: b"user:1001".to_vec(),
                ttl_ms: 0,
                snapshot: b"\x00\x05hello\x0b\x00".to_vec(),
            },
            Record {
                key: Vec::new(),
                ttl_ms: 1500,
                snapshot: Vec::new(),
            },
            Record {
                key: every_byte.clone(),
                ttl_ms: i64::MAX,
                snapshot: every_byte.iter().rev().copied().collect(),
            },
            Record {
                key: vec![0xff, 0xfe, 0x00],
                ttl_ms: 86_400_000,
                snapshot: every_byte,
            },
        ]
    }

    #[tokio::test]
    async fn test_round_trip_preserves_sequence() {
        let records = sample_records();
        let bytes = encode(&records).await;

        let decoded = decode_all(&bytes).await.unwrap();
        assert_eq!(decoded, records);
    }

    #[tokio::test]
    async fn test_wire_layout_is_big_endian() {
        let bytes = encode(&[Record {
            key: b"k".to_vec(),
            ttl_ms: 258,
            snapshot: b"ab".to_vec(),
        }])
        .await;

        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 1, b'k', // key
                0, 0, 0, 0, 0, 0, 1, 2, // ttl
                0, 0, 0, 2, b'a', b'b', // snapshot
            ]
        );
    }

    #[tokio::test]
    async fn test_negative_ttl_written_as_zero() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key", -2, b"payload").await.unwrap();

        let record = read_record(&mut Cursor::new(buf)).await.unwrap().unwrap();
        assert_eq!(record.ttl_ms, 0);
    }

    #[tokio::test]
    async fn test_empty_stream_ends_cleanly() {
        let decoded = decode_all(&[]).await.unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_truncation_inside_record_is_an_error() {
        let records = sample_records();
        let bytes = encode(&records).await;

        // Record boundaries, excluding the start of the stream
        let mut boundaries = Vec::new();
        let mut offset = 0;
        for record in &records {
            offset += 4 + record.key.len() + 8 + 4 + record.snapshot.len();
            boundaries.push(offset);
        }

        for cut in 1..bytes.len() {
            let result = decode_all(&bytes[..cut]).await;
            if boundaries.contains(&cut) {
                let decoded = result.unwrap();
                let expected = boundaries.iter().position(|&b| b == cut).unwrap() + 1;
                assert_eq!(decoded.len(), expected, "cut at {}", cut);
            } else {
                assert!(
                    matches!(result, Err(RecordError::Truncated { .. })),
                    "cut at {} should be truncated",
                    cut
                );
            }
        }
    }

    #[tokio::test]
    async fn test_corrupt_length_does_not_allocate() {
        // key_len claims 4 GiB but nothing follows
        let bytes = vec![0xff, 0xff, 0xff, 0xff, b'x'];
        let err = decode_all(&bytes).await.unwrap_err();
        match err {
            RecordError::Truncated {
                field,
                expected,
                actual,
            } => {
                assert_eq!(field, "key");
                assert_eq!(expected, u64::from(u32::MAX));
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inspect_stream_counts_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dump");
        tokio::fs::write(&path, encode(&sample_records()).await)
            .await
            .unwrap();

        let stats = inspect_stream(&path).await.unwrap();
        assert_eq!(stats.records, 4);
        assert_eq!(stats.records_with_ttl, 3);
        assert_eq!(stats.key_bytes, 9 + 256 + 3);
        assert_eq!(stats.snapshot_bytes, 9 + 256 + 256);
    }
}
