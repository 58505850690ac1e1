//! Store implementation over the `redis` crate
//!
//! The coordinating connection is a [`ClusterConnection`], which routes every
//! keyed command to the node owning the key's slot. Node scans use plain
//! multiplexed connections to one node each.

use super::{ClusterStore, Connector, KeyType, KeyValue, NodeScanner};
use crate::config::ClusterEndpoint;
use crate::error::StoreError;
use crate::topology::{NodeAddr, StructuredNode, TopologyReply};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Opens real cluster and node connections
#[derive(Debug, Clone, Copy, Default)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    type Cluster = RedisClusterStore;
    type Node = RedisNodeScanner;

    async fn connect_cluster(
        &self,
        endpoint: &ClusterEndpoint,
    ) -> Result<RedisClusterStore, StoreError> {
        debug!("Opening cluster connection to {}", endpoint);
        let client = ClusterClient::new(vec![endpoint.url()])?;
        let conn = client.get_async_connection().await?;
        Ok(RedisClusterStore { conn })
    }

    async fn connect_node(
        &self,
        endpoint: &ClusterEndpoint,
        node: &NodeAddr,
    ) -> Result<RedisNodeScanner, StoreError> {
        debug!("Opening direct connection to node {}", node);
        let client = redis::Client::open(endpoint.node_url(node))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisNodeScanner { conn })
    }
}

/// Slot-routed cluster connection
pub struct RedisClusterStore {
    conn: ClusterConnection,
}

#[async_trait]
impl ClusterStore for RedisClusterStore {
    async fn ping(&mut self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn cluster_nodes(&mut self) -> Result<TopologyReply, StoreError> {
        let reply: Value = redis::cmd("CLUSTER")
            .arg("NODES")
            .query_async(&mut self.conn)
            .await?;
        topology_from_value(reply)
    }

    async fn pttl(&mut self, key: &[u8]) -> Result<i64, StoreError> {
        Ok(redis::cmd("PTTL").arg(key).query_async(&mut self.conn).await?)
    }

    async fn ttl(&mut self, key: &[u8]) -> Result<i64, StoreError> {
        Ok(redis::cmd("TTL").arg(key).query_async(&mut self.conn).await?)
    }

    async fn dump(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(redis::cmd("DUMP").arg(key).query_async(&mut self.conn).await?)
    }

    async fn replace_from_snapshot(
        &mut self,
        key: &[u8],
        ttl_ms: i64,
        snapshot: &[u8],
    ) -> Result<(), StoreError> {
        // No REPLACE: a key that reappears after DEL makes RESTORE fail with BUSYKEY
        let mut pipe = redis::pipe();
        pipe.cmd("DEL")
            .arg(key)
            .ignore()
            .cmd("RESTORE")
            .arg(key)
            .arg(ttl_ms)
            .arg(snapshot)
            .ignore();

        let _: () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn key_type(&mut self, key: &[u8]) -> Result<String, StoreError> {
        Ok(redis::cmd("TYPE").arg(key).query_async(&mut self.conn).await?)
    }

    async fn read_value(
        &mut self,
        key: &[u8],
        kind: KeyType,
    ) -> Result<Option<KeyValue>, StoreError> {
        let conn = &mut self.conn;
        let value = match kind {
            KeyType::String => {
                let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(conn).await?;
                match value {
                    Some(value) => KeyValue::String(value),
                    None => return Ok(None),
                }
            }
            KeyType::List => KeyValue::List(
                redis::cmd("LRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(-1)
                    .query_async(conn)
                    .await?,
            ),
            KeyType::Hash => {
                let fields: BTreeMap<Vec<u8>, Vec<u8>> =
                    redis::cmd("HGETALL").arg(key).query_async(conn).await?;
                KeyValue::Hash(fields)
            }
            KeyType::Set => {
                KeyValue::Set(redis::cmd("SMEMBERS").arg(key).query_async(conn).await?)
            }
            KeyType::ZSet => KeyValue::ZSet(
                redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(0)
                    .arg(-1)
                    .arg("WITHSCORES")
                    .query_async(conn)
                    .await?,
            ),
        };

        Ok(Some(value))
    }
}

/// Direct connection to a single node
pub struct RedisNodeScanner {
    conn: MultiplexedConnection,
}

#[async_trait]
impl NodeScanner for RedisNodeScanner {
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>), StoreError> {
        let (next, keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?;
        Ok((next, keys))
    }
}

/// Classify a `CLUSTER NODES` reply into one of the two known shapes.
fn topology_from_value(value: Value) -> Result<TopologyReply, StoreError> {
    match value {
        Value::BulkString(bytes) => Ok(TopologyReply::Lines(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Value::SimpleString(text) => Ok(TopologyReply::Lines(text)),
        Value::VerbatimString { text, .. } => Ok(TopologyReply::Lines(text)),
        Value::Map(entries) => {
            let mut nodes = Vec::with_capacity(entries.len());
            for (address, info) in entries {
                let address = value_text(&address).ok_or_else(|| {
                    StoreError::UnexpectedReply(format!("topology key {:?}", address))
                })?;
                let fields = match info {
                    Value::Map(fields) => fields
                        .iter()
                        .filter_map(|(k, v)| Some((value_text(k)?, value_text(v)?)))
                        .collect(),
                    // Entries that are not mappings carry no flags and never qualify
                    _ => HashMap::new(),
                };
                nodes.push(StructuredNode { address, fields });
            }
            Ok(TopologyReply::Structured(nodes))
        }
        other => Err(StoreError::UnexpectedReply(format!(
            "CLUSTER NODES returned {:?}",
            other
        ))),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(text) => Some(text.clone()),
        Value::VerbatimString { text, .. } => Some(text.clone()),
        Value::Int(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        Value::Okay => Some("OK".to_string()),
        _ => None,
    }
}
