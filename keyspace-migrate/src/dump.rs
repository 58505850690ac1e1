//! Dump a cluster's key space to a record stream
//!
//! Keys are enumerated master by master and written as they arrive. A key
//! that disappears between enumeration and `DUMP` is skipped. On failure the
//! records written so far are flushed and left on disk; the stream format
//! stays readable up to the last complete record.

use crate::config::{ClusterEndpoint, DEFAULT_SCAN_BATCH};
use crate::enumerate::{KeyScan, enumerate_masters};
use crate::progress::Progress;
use crate::record;
use crate::store::{ClusterStore, Connector, display_key};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// Dump options
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// `COUNT` hint for node-local scans
    pub scan_batch: usize,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }
}

/// Outcome of a dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    /// Records written to the stream, one per distinct key
    pub written: u64,
    /// Keys enumerated but gone by the time they were dumped
    pub vanished: u64,
}

/// Map a `PTTL` reply to the value stored in a record: negative sentinels
/// (no expiration, missing key) become 0.
pub fn normalize_ttl(pttl: i64) -> i64 {
    pttl.max(0)
}

/// Dump every key of the cluster at `endpoint` into `output`.
pub async fn dump<C: Connector>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    output: &Path,
    options: &DumpOptions,
    progress: &Progress,
) -> Result<DumpSummary> {
    let mut cluster = connector
        .connect_cluster(endpoint)
        .await
        .with_context(|| format!("Failed to connect to cluster at {}", endpoint))?;
    cluster
        .ping()
        .await
        .with_context(|| format!("Cluster at {} did not answer PING", endpoint))?;

    info!(
        "Connected to cluster at {}. Starting key dump to {:?}...",
        endpoint, output
    );

    let file = File::create(output)
        .await
        .with_context(|| format!("Failed to create dump file {:?}", output))?;
    let mut writer = BufWriter::new(file);

    let outcome = write_keyspace(
        connector,
        endpoint,
        &mut cluster,
        &mut writer,
        options,
        progress,
    )
    .await;
    // Flush whatever was written, even if the pass failed part way
    let flushed = writer.flush().await;
    progress.finish();

    let summary = outcome?;
    flushed.with_context(|| format!("Failed to flush dump file {:?}", output))?;

    info!("Dump complete. Total keys saved: {}", summary.written);
    if summary.vanished > 0 {
        info!("{} keys vanished before they could be dumped", summary.vanished);
    }
    Ok(summary)
}

async fn write_keyspace<C, W>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    cluster: &mut C::Cluster,
    writer: &mut W,
    options: &DumpOptions,
    progress: &Progress,
) -> Result<DumpSummary>
where
    C: Connector,
    W: AsyncWrite + Unpin,
{
    let masters = enumerate_masters(cluster).await?;
    let mut scan = KeyScan::new(connector, endpoint, masters, options.scan_batch);
    let mut summary = DumpSummary::default();

    while let Some(keys) = scan.next_batch().await? {
        for key in keys {
            let ttl_ms = normalize_ttl(
                cluster
                    .pttl(&key)
                    .await
                    .with_context(|| format!("PTTL failed for key '{}'", display_key(&key)))?,
            );
            let snapshot = cluster
                .dump(&key)
                .await
                .with_context(|| format!("DUMP failed for key '{}'", display_key(&key)))?;

            match snapshot {
                Some(snapshot) if !snapshot.is_empty() => {
                    record::write_record(writer, &key, ttl_ms, &snapshot)
                        .await
                        .context("Failed to write record")?;
                    summary.written += 1;
                    progress.update(summary.written);
                }
                _ => {
                    debug!("Key '{}' vanished before DUMP, skipping", display_key(&key));
                    summary.vanished += 1;
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Interference, KeyValue, MemoryCluster};
    use tempfile::TempDir;

    #[test]
    fn test_normalize_ttl() {
        assert_eq!(normalize_ttl(-1), 0);
        assert_eq!(normalize_ttl(-2), 0);
        assert_eq!(normalize_ttl(i64::MIN), 0);
        assert_eq!(normalize_ttl(0), 0);
        assert_eq!(normalize_ttl(1500), 1500);
    }

    #[tokio::test]
    async fn test_key_deleted_before_dump_is_skipped() {
        let source = MemoryCluster::new("127.0.0.1", 7000, 3);
        for i in 0..5 {
            source.insert(
                format!("key:{}", i),
                KeyValue::String(i.to_string().into_bytes()),
                None,
            );
        }
        source.interfere("key:3", Interference::DeleteBeforeDump);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.dump");
        let summary = dump(
            &source,
            &source.seed_endpoint(),
            &path,
            &DumpOptions::default(),
            &Progress::hidden("dumped"),
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            DumpSummary {
                written: 4,
                vanished: 1
            }
        );

        let bytes = std::fs::read(&path).unwrap();
        let mut reader = bytes.as_slice();
        let mut keys = Vec::new();
        while let Some(record) = record::read_record(&mut reader).await.unwrap() {
            keys.push(record.key);
        }
        assert_eq!(keys.len(), 4);
        assert!(!keys.contains(&b"key:3".to_vec()));
    }
}
