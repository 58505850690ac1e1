//! Cluster store abstraction
//!
//! Migration and verification talk to a cluster through two kinds of
//! connection: a slot-routed coordinating connection ([`ClusterStore`]) for
//! every per-key read and write, and direct node connections
//! ([`NodeScanner`]) used only to walk each master's local key space.

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod redis_cluster;

use crate::config::ClusterEndpoint;
use crate::error::StoreError;
use crate::topology::{NodeAddr, TopologyReply};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[cfg(any(test, feature = "test-util"))]
pub use self::memory::{Interference, MemoryCluster, MemoryNetwork, TopologyShape};
pub use self::redis_cluster::RedisConnector;

/// Slot-routed connection to a whole cluster
#[async_trait]
pub trait ClusterStore: Send {
    async fn ping(&mut self) -> Result<(), StoreError>;

    /// Topology as reported by whichever node answers
    async fn cluster_nodes(&mut self) -> Result<TopologyReply, StoreError>;

    /// Remaining TTL in milliseconds (`-1` no expiration, `-2` missing key)
    async fn pttl(&mut self, key: &[u8]) -> Result<i64, StoreError>;

    /// Remaining TTL in seconds (`-1` no expiration, `-2` missing key)
    async fn ttl(&mut self, key: &[u8]) -> Result<i64, StoreError>;

    /// Native serialization of the key, `None` if the key does not exist
    async fn dump(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete `key`, then recreate it from `snapshot` with `ttl_ms`
    /// (0 = persistent). Sent as one non-transactional batch. The restore
    /// step never overwrites, so it fails if the key reappeared in between.
    async fn replace_from_snapshot(
        &mut self,
        key: &[u8],
        ttl_ms: i64,
        snapshot: &[u8],
    ) -> Result<(), StoreError>;

    /// Type name as reported by the store (`string`, `list`, `none`, ...)
    async fn key_type(&mut self, key: &[u8]) -> Result<String, StoreError>;

    /// Full value of `key` read as `kind`, `None` if it vanished
    async fn read_value(
        &mut self,
        key: &[u8],
        kind: KeyType,
    ) -> Result<Option<KeyValue>, StoreError>;
}

/// Direct connection to one node, used for node-local key scans
#[async_trait]
pub trait NodeScanner: Send {
    /// One `SCAN` step. Returns the next cursor (0 when finished) and keys.
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>), StoreError>;
}

/// Opens connections to a cluster and to its individual nodes
#[async_trait]
pub trait Connector: Sync {
    type Cluster: ClusterStore;
    type Node: NodeScanner;

    async fn connect_cluster(&self, endpoint: &ClusterEndpoint)
    -> Result<Self::Cluster, StoreError>;

    /// Connect to one node of the cluster reached through `endpoint`
    async fn connect_node(
        &self,
        endpoint: &ClusterEndpoint,
        node: &NodeAddr,
    ) -> Result<Self::Node, StoreError>;
}

/// Value types the verifier knows how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    String,
    List,
    Hash,
    Set,
    ZSet,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::List => "list",
            Self::Hash => "hash",
            Self::Set => "set",
            Self::ZSet => "zset",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(Self::String),
            "list" => Ok(Self::List),
            "hash" => Ok(Self::Hash),
            "set" => Ok(Self::Set),
            "zset" => Ok(Self::ZSet),
            other => Err(other.to_string()),
        }
    }
}

/// Full value of a key
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    String(Vec<u8>),
    List(Vec<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(Vec<Vec<u8>>),
    ZSet(Vec<(Vec<u8>, f64)>),
}

impl KeyValue {
    pub fn kind(&self) -> KeyType {
        match self {
            Self::String(_) => KeyType::String,
            Self::List(_) => KeyType::List,
            Self::Hash(_) => KeyType::Hash,
            Self::Set(_) => KeyType::Set,
            Self::ZSet(_) => KeyType::ZSet,
        }
    }

    /// Equality as used by verification.
    ///
    /// Lists, sets and sorted sets are compared as sorted sequences since
    /// reads from independent connections do not promise a stable order.
    /// Strings and hashes must match exactly.
    pub fn equivalent(&self, other: &KeyValue) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Hash(a), Self::Hash(b)) => a == b,
            (Self::List(a), Self::List(b)) | (Self::Set(a), Self::Set(b)) => {
                sorted(a) == sorted(b)
            }
            (Self::ZSet(a), Self::ZSet(b)) => sorted_scores(a) == sorted_scores(b),
            _ => false,
        }
    }
}

fn sorted(items: &[Vec<u8>]) -> Vec<&[u8]> {
    let mut items: Vec<&[u8]> = items.iter().map(Vec::as_slice).collect();
    items.sort_unstable();
    items
}

fn sorted_scores(items: &[(Vec<u8>, f64)]) -> Vec<(&[u8], f64)> {
    let mut items: Vec<(&[u8], f64)> = items.iter().map(|(m, s)| (m.as_slice(), *s)).collect();
    items.sort_by(|a, b| a.0.cmp(b.0).then(a.1.total_cmp(&b.1)));
    items
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{:?}", display_key(v)),
            Self::List(items) | Self::Set(items) => {
                let items: Vec<Cow<'_, str>> = items.iter().map(|i| display_key(i)).collect();
                write!(f, "{:?}", items)
            }
            Self::Hash(fields) => {
                let fields: BTreeMap<Cow<'_, str>, Cow<'_, str>> = fields
                    .iter()
                    .map(|(k, v)| (display_key(k), display_key(v)))
                    .collect();
                write!(f, "{:?}", fields)
            }
            Self::ZSet(members) => {
                let members: Vec<(Cow<'_, str>, f64)> =
                    members.iter().map(|(m, s)| (display_key(m), *s)).collect();
                write!(f, "{:?}", members)
            }
        }
    }
}

/// Best-effort text form of binary key or value bytes, for messages only.
pub fn display_key(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_key_type_parse() {
        assert_eq!("zset".parse::<KeyType>(), Ok(KeyType::ZSet));
        assert_eq!("hash".parse::<KeyType>(), Ok(KeyType::Hash));
        assert_eq!("stream".parse::<KeyType>(), Err("stream".to_string()));
        assert_eq!("none".parse::<KeyType>(), Err("none".to_string()));
    }

    #[test]
    fn test_list_order_insensitive() {
        let source = KeyValue::List(bytes(&["3", "1", "2"]));
        let target = KeyValue::List(bytes(&["1", "2", "3"]));
        assert!(source.equivalent(&target));

        let shorter = KeyValue::List(bytes(&["1", "2"]));
        assert!(!source.equivalent(&shorter));
    }

    #[test]
    fn test_list_duplicates_matter() {
        let source = KeyValue::List(bytes(&["a", "a", "b"]));
        let target = KeyValue::List(bytes(&["a", "b", "b"]));
        assert!(!source.equivalent(&target));
    }

    #[test]
    fn test_set_and_zset_order_insensitive() {
        let a = KeyValue::Set(bytes(&["x", "y"]));
        let b = KeyValue::Set(bytes(&["y", "x"]));
        assert!(a.equivalent(&b));

        let a = KeyValue::ZSet(vec![(b"m1".to_vec(), 1.0), (b"m2".to_vec(), 2.5)]);
        let b = KeyValue::ZSet(vec![(b"m2".to_vec(), 2.5), (b"m1".to_vec(), 1.0)]);
        assert!(a.equivalent(&b));

        let c = KeyValue::ZSet(vec![(b"m2".to_vec(), 2.0), (b"m1".to_vec(), 1.0)]);
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn test_string_and_hash_exact() {
        assert!(KeyValue::String(b"v".to_vec()).equivalent(&KeyValue::String(b"v".to_vec())));
        assert!(!KeyValue::String(b"v".to_vec()).equivalent(&KeyValue::String(b"w".to_vec())));

        let a = KeyValue::Hash(BTreeMap::from([(b"f".to_vec(), b"1".to_vec())]));
        let b = KeyValue::Hash(BTreeMap::from([(b"f".to_vec(), b"2".to_vec())]));
        assert!(a.equivalent(&a.clone()));
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn test_different_kinds_never_equivalent() {
        let list = KeyValue::List(bytes(&["a"]));
        let set = KeyValue::Set(bytes(&["a"]));
        assert!(!list.equivalent(&set));
    }

    #[test]
    fn test_display_key_is_lossy() {
        assert_eq!(display_key(b"user:1"), "user:1");
        assert_eq!(display_key(&[b'k', 0xff]), "k\u{fffd}");
    }
}
