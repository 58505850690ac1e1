//! Restore a record stream into a cluster
//!
//! Every record becomes a DEL followed by a non-overwriting RESTORE, so a
//! rerun against a partially restored target converges to the same state.
//! A record the target rejects is logged and skipped; I/O errors, a
//! truncated stream or a lost connection abort the run.

use crate::config::ClusterEndpoint;
use crate::progress::Progress;
use crate::record;
use crate::store::{ClusterStore, Connector, display_key};
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tracing::{info, warn};

/// Outcome of a restore
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    /// Records applied to the target
    pub restored: u64,
    /// Records the target refused
    pub rejected: u64,
}

/// Restore every record in `input` into the cluster at `endpoint`.
pub async fn restore<C: Connector>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    input: &Path,
    progress: &Progress,
) -> Result<RestoreSummary> {
    let mut cluster = connector
        .connect_cluster(endpoint)
        .await
        .with_context(|| format!("Failed to connect to cluster at {}", endpoint))?;
    cluster
        .ping()
        .await
        .with_context(|| format!("Cluster at {} did not answer PING", endpoint))?;

    info!(
        "Connected to cluster at {}. Starting key restore from {:?}...",
        endpoint, input
    );

    let file = File::open(input)
        .await
        .with_context(|| format!("Failed to open dump file {:?}", input))?;
    let mut reader = BufReader::new(file);

    let outcome = restore_records(&mut cluster, &mut reader, progress).await;
    progress.finish();
    let summary = outcome?;

    info!("Restore complete. Total keys processed: {}", summary.restored);
    if summary.rejected > 0 {
        warn!("{} keys could not be restored", summary.rejected);
    }
    Ok(summary)
}

/// Apply records from `reader` until the stream ends.
pub async fn restore_records<S, R>(
    cluster: &mut S,
    reader: &mut R,
    progress: &Progress,
) -> Result<RestoreSummary>
where
    S: ClusterStore,
    R: AsyncRead + Unpin,
{
    let mut summary = RestoreSummary::default();

    while let Some(record) = record::read_record(reader)
        .await
        .context("Failed to read record stream")?
    {
        match cluster
            .replace_from_snapshot(&record.key, record.ttl_ms, &record.snapshot)
            .await
        {
            Ok(()) => {
                summary.restored += 1;
                progress.update(summary.restored);
            }
            Err(e) if e.is_rejection() => {
                warn!("Could not restore key '{}': {}", display_key(&record.key), e);
                summary.rejected += 1;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to restore key '{}'", display_key(&record.key))
                });
            }
        }
    }

    Ok(summary)
}
