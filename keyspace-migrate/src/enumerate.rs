//! Cluster key enumeration
//!
//! `SCAN` on a cluster connection only walks whichever node it lands on, so
//! the full key space is enumerated by scanning every master directly. The
//! topology is re-read on every call since roles change between runs.

use crate::config::ClusterEndpoint;
use crate::store::{ClusterStore, Connector, NodeScanner};
use crate::topology::{self, NodeAddr};
use anyhow::{Context, Result};
use futures_util::future::try_join_all;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

/// Pattern matching every key
pub const MATCH_ALL: &str = "*";

/// Addresses of all nodes currently holding the master role
pub async fn enumerate_masters<S: ClusterStore>(cluster: &mut S) -> Result<BTreeSet<NodeAddr>> {
    let reply = cluster
        .cluster_nodes()
        .await
        .context("Failed to query cluster topology")?;
    let nodes = reply
        .into_nodes()
        .context("Failed to parse cluster topology")?;

    let masters = topology::master_addrs(&nodes);
    info!("Found {} master nodes", masters.len());
    Ok(masters)
}

/// Scan every master independently and merge the keys into one set.
///
/// Masters are scanned concurrently; each scan produces its own batch and
/// the batches are merged only once all of them have finished.
pub async fn scan_all_keys<C: Connector>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    masters: &BTreeSet<NodeAddr>,
    batch: usize,
) -> Result<BTreeSet<Vec<u8>>> {
    let per_node = try_join_all(
        masters
            .iter()
            .map(|node| scan_node(connector, endpoint, node, batch)),
    )
    .await?;

    Ok(per_node.into_iter().flatten().collect())
}

async fn scan_node<C: Connector>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    node: &NodeAddr,
    batch: usize,
) -> Result<Vec<Vec<u8>>> {
    info!("Scanning {}...", node);
    let mut conn = connector
        .connect_node(endpoint, node)
        .await
        .with_context(|| format!("Failed to connect to node {}", node))?;

    let mut keys = Vec::new();
    let mut cursor = 0;
    loop {
        let (next, page) = conn
            .scan(cursor, MATCH_ALL, batch)
            .await
            .with_context(|| format!("SCAN failed on node {}", node))?;
        keys.extend(page);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    debug!("Node {} reported {} keys", node, keys.len());
    Ok(keys)
}

/// Lazy key enumeration, one `SCAN` page at a time, master after master.
///
/// Used where keys are processed as they arrive rather than collected.
/// `SCAN` may return a key more than once; repeats within one node's scan
/// are dropped, so every key is yielded once.
pub struct KeyScan<'a, C: Connector> {
    connector: &'a C,
    endpoint: &'a ClusterEndpoint,
    masters: Vec<NodeAddr>,
    next_master: usize,
    current: Option<(NodeAddr, C::Node)>,
    cursor: u64,
    batch: usize,
    /// Keys already yielded for the current node
    seen: HashSet<Vec<u8>>,
}

impl<'a, C: Connector> KeyScan<'a, C> {
    pub fn new(
        connector: &'a C,
        endpoint: &'a ClusterEndpoint,
        masters: BTreeSet<NodeAddr>,
        batch: usize,
    ) -> Self {
        Self {
            connector,
            endpoint,
            masters: masters.into_iter().collect(),
            next_master: 0,
            current: None,
            cursor: 0,
            batch,
            seen: HashSet::new(),
        }
    }

    /// Next non-empty page of keys, `None` once every master is exhausted
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        loop {
            if self.current.is_none() {
                let Some(node) = self.masters.get(self.next_master).cloned() else {
                    return Ok(None);
                };
                self.next_master += 1;

                info!("Scanning {}...", node);
                let conn = self
                    .connector
                    .connect_node(self.endpoint, &node)
                    .await
                    .with_context(|| format!("Failed to connect to node {}", node))?;
                self.current = Some((node, conn));
                self.cursor = 0;
                self.seen.clear();
            }

            let Some((node, conn)) = self.current.as_mut() else {
                continue;
            };
            let (next, mut page) = conn
                .scan(self.cursor, MATCH_ALL, self.batch)
                .await
                .with_context(|| format!("SCAN failed on node {}", node))?;

            if next == 0 {
                self.current = None;
            } else {
                self.cursor = next;
            }
            page.retain(|key| self.seen.insert(key.clone()));
            if !page.is_empty() {
                return Ok(Some(page));
            }
        }
    }
}
