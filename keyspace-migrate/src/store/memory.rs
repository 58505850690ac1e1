//! In-process sharded cluster
//!
//! Models enough of a real cluster to run dump, restore and verify without a
//! network:
//! - masters own contiguous hash-slot ranges, replicas mirror their master
//! - node-local `SCAN` only sees keys whose slot the node serves
//! - expirations are tracked with millisecond precision
//! - `DUMP` payloads end with a version tag and CRC-64 that `RESTORE` checks
//!
//! Only built for tests or with the `test-util` feature.

use super::{ClusterStore, Connector, KeyType, KeyValue, NodeScanner};
use crate::config::ClusterEndpoint;
use crate::error::StoreError;
use crate::topology::{NodeAddr, StructuredNode, TopologyReply};
use async_trait::async_trait;
use crc::{CRC_16_XMODEM, CRC_64_REDIS, Crc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Total number of hash slots
pub const TOTAL_SLOTS: u16 = 16384;

const PAYLOAD_VERSION: u16 = 1;
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

/// Calculate the hash slot of a key (CRC16 mod 16384, honouring `{tag}`)
pub fn hash_slot(key: &[u8]) -> u16 {
    CRC16.checksum(hash_tag(key).unwrap_or(key)) % TOTAL_SLOTS
}

fn hash_tag(key: &[u8]) -> Option<&[u8]> {
    let start = key.iter().position(|&b| b == b'{')?;
    let len = key[start + 1..].iter().position(|&b| b == b'}')?;
    if len == 0 {
        return None;
    }
    Some(&key[start + 1..start + 1 + len])
}

/// Which shape `CLUSTER NODES` replies in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyShape {
    #[default]
    Lines,
    Structured,
}

/// Behaviour of a concurrent client, injected for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interference {
    /// The key is deleted right before `DUMP` is answered
    DeleteBeforeDump,
    /// The key is deleted right before `TYPE` is answered
    DeleteBeforeType,
    /// Value reads fail with a wrong-type error
    RejectReads,
}

/// Stored representation, including types the verifier does not read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Stored {
    String(Vec<u8>),
    List(Vec<Vec<u8>>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
    Set(BTreeSet<Vec<u8>>),
    /// Kept in `ZRANGE` order: by score, then member
    ZSet(Vec<(Vec<u8>, f64)>),
    Other { type_name: String, payload: Vec<u8> },
}

impl Stored {
    fn type_name(&self) -> &str {
        match self {
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
            Self::ZSet(_) => "zset",
            Self::Other { type_name, .. } => type_name,
        }
    }

    fn to_value(&self) -> Option<KeyValue> {
        Some(match self {
            Self::String(v) => KeyValue::String(v.clone()),
            Self::List(items) => KeyValue::List(items.clone()),
            Self::Hash(fields) => KeyValue::Hash(fields.iter().cloned().collect()),
            Self::Set(members) => KeyValue::Set(members.iter().cloned().collect()),
            Self::ZSet(members) => KeyValue::ZSet(members.clone()),
            Self::Other { .. } => return None,
        })
    }
}

impl From<KeyValue> for Stored {
    fn from(value: KeyValue) -> Self {
        match value {
            KeyValue::String(v) => Self::String(v),
            KeyValue::List(items) => Self::List(items),
            KeyValue::Hash(fields) => Self::Hash(fields.into_iter().collect()),
            KeyValue::Set(members) => Self::Set(members.into_iter().collect()),
            KeyValue::ZSet(mut members) => {
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Self::ZSet(members)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct MemoryNode {
    id: String,
    addr: NodeAddr,
    /// Index of the master this node replicates, `None` for masters
    replica_of: Option<usize>,
    /// Served slot range, inclusive
    slots: (u16, u16),
}

impl MemoryNode {
    fn serves(&self, slot: u16) -> bool {
        slot >= self.slots.0 && slot <= self.slots.1
    }
}

#[derive(Debug)]
struct ClusterState {
    nodes: Vec<MemoryNode>,
    entries: BTreeMap<Vec<u8>, Entry>,
    shape: TopologyShape,
    interference: HashMap<Vec<u8>, Interference>,
}

impl ClusterState {
    /// Drop `key` if it has expired, then look it up.
    fn live(&mut self, key: &[u8]) -> Option<&Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn pttl(&mut self, key: &[u8]) -> i64 {
        match self.live(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
        }
    }

    /// Apply a pending deletion for `key`, if `when` is what was injected.
    fn interfere(&mut self, key: &[u8], when: Interference) {
        if self.interference.get(key) == Some(&when) {
            self.entries.remove(key);
        }
    }

    fn node_index(&self, addr: &NodeAddr) -> Option<usize> {
        self.nodes.iter().position(|n| &n.addr == addr)
    }

    fn topology(&self) -> TopologyReply {
        match self.shape {
            TopologyShape::Lines => {
                let mut text = String::new();
                for (idx, node) in self.nodes.iter().enumerate() {
                    let (flags, master) = match node.replica_of {
                        None if idx == 0 => ("myself,master", "-".to_string()),
                        None => ("master", "-".to_string()),
                        Some(m) => ("slave", self.nodes[m].id.clone()),
                    };
                    text.push_str(&format!(
                        "{} {}:{}@{} {} {} 0 0 {} connected",
                        node.id,
                        node.addr.host,
                        node.addr.port,
                        u32::from(node.addr.port) + 10000,
                        flags,
                        master,
                        idx + 1
                    ));
                    if node.replica_of.is_none() {
                        text.push_str(&format!(" {}-{}", node.slots.0, node.slots.1));
                    }
                    text.push('\n');
                }
                TopologyReply::Lines(text)
            }
            TopologyShape::Structured => TopologyReply::Structured(
                self.nodes
                    .iter()
                    .map(|node| {
                        let flags = if node.replica_of.is_some() {
                            "slave"
                        } else {
                            "master"
                        };
                        StructuredNode {
                            address: node.addr.to_string(),
                            fields: HashMap::from([
                                ("node_id".to_string(), node.id.clone()),
                                ("flags".to_string(), flags.to_string()),
                                ("connected".to_string(), "True".to_string()),
                            ]),
                        }
                    })
                    .collect(),
            ),
        }
    }
}

/// Encode a DUMP payload: body, version (LE u16), CRC-64 (LE u64)
fn encode_payload(value: &Stored) -> Result<Vec<u8>, StoreError> {
    let mut payload =
        serde_json::to_vec(value).map_err(|e| StoreError::UnexpectedReply(e.to_string()))?;
    payload.extend_from_slice(&PAYLOAD_VERSION.to_le_bytes());
    let checksum = CRC64.checksum(&payload);
    payload.extend_from_slice(&checksum.to_le_bytes());
    Ok(payload)
}

fn decode_payload(payload: &[u8]) -> Option<Stored> {
    if payload.len() < 10 {
        return None;
    }
    let (signed, checksum) = payload.split_at(payload.len() - 8);
    let checksum = u64::from_le_bytes(checksum.try_into().ok()?);
    if CRC64.checksum(signed) != checksum {
        return None;
    }
    let (body, version) = signed.split_at(signed.len() - 2);
    if u16::from_le_bytes(version.try_into().ok()?) != PAYLOAD_VERSION {
        return None;
    }
    serde_json::from_slice(body).ok()
}

/// Match a `SCAN MATCH` glob (`*` and `?`) against a key
fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    let (mut p, mut k) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, k));
                p += 1;
            }
            Some(&c) if c == b'?' || c == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    k = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// In-process cluster; clones share the same data
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    /// Build a cluster of `masters` masters (ports from `base_port`), each
    /// with one replica on the following ports.
    pub fn new(host: &str, base_port: u16, masters: usize) -> Self {
        let masters = masters.clamp(1, usize::from(TOTAL_SLOTS));
        let mut nodes = Vec::with_capacity(masters * 2);

        for i in 0..masters {
            let start = (i * usize::from(TOTAL_SLOTS) / masters) as u16;
            let end = ((i + 1) * usize::from(TOTAL_SLOTS) / masters - 1) as u16;
            nodes.push(MemoryNode {
                id: format!("{:040x}", i + 1),
                addr: NodeAddr::new(host, base_port + i as u16),
                replica_of: None,
                slots: (start, end),
            });
        }
        for i in 0..masters {
            let slots = nodes[i].slots;
            nodes.push(MemoryNode {
                id: format!("{:040x}", masters + i + 1),
                addr: NodeAddr::new(host, base_port + (masters + i) as u16),
                replica_of: Some(i),
                slots,
            });
        }

        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes,
                entries: BTreeMap::new(),
                shape: TopologyShape::default(),
                interference: HashMap::new(),
            })),
        }
    }

    /// Reply to `CLUSTER NODES` in the given shape
    pub fn with_topology(self, shape: TopologyShape) -> Self {
        self.state.lock().shape = shape;
        self
    }

    /// Endpoint of the first master
    pub fn seed_endpoint(&self) -> ClusterEndpoint {
        let state = self.state.lock();
        let addr = &state.nodes[0].addr;
        ClusterEndpoint::new(addr.host.clone(), addr.port)
    }

    /// Set `key` to `value`, replacing any previous value
    pub fn insert(&self, key: impl AsRef<[u8]>, value: KeyValue, ttl: Option<Duration>) {
        self.put(key.as_ref(), value.into(), ttl);
    }

    /// Set `key` to a value of a type outside [`KeyType`] (e.g. `stream`)
    pub fn insert_opaque(&self, key: impl AsRef<[u8]>, type_name: &str, payload: Vec<u8>) {
        let value = Stored::Other {
            type_name: type_name.to_string(),
            payload,
        };
        self.put(key.as_ref(), value, None);
    }

    fn put(&self, key: &[u8], value: Stored, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state
            .lock()
            .entries
            .insert(key.to_vec(), Entry { value, expires_at });
    }

    /// Make connections misbehave for `key` as a concurrent client would
    pub fn interfere(&self, key: impl AsRef<[u8]>, interference: Interference) {
        self.state
            .lock()
            .interference
            .insert(key.as_ref().to_vec(), interference);
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<KeyValue> {
        let mut state = self.state.lock();
        state.live(key.as_ref()).and_then(|e| e.value.to_value())
    }

    pub fn contains(&self, key: impl AsRef<[u8]>) -> bool {
        self.state.lock().live(key.as_ref()).is_some()
    }

    /// Remaining TTL in milliseconds, with `PTTL` sentinels
    pub fn pttl_of(&self, key: impl AsRef<[u8]>) -> i64 {
        self.state.lock().pttl(key.as_ref())
    }

    pub fn remove(&self, key: impl AsRef<[u8]>) -> bool {
        self.state.lock().entries.remove(key.as_ref()).is_some()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.entries.retain(|_, e| !e.is_expired(now));
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    type Cluster = MemoryClusterConn;
    type Node = MemoryNodeConn;

    async fn connect_cluster(
        &self,
        endpoint: &ClusterEndpoint,
    ) -> Result<MemoryClusterConn, StoreError> {
        let seed = NodeAddr::new(endpoint.host.clone(), endpoint.port);
        if self.state.lock().node_index(&seed).is_none() {
            return Err(StoreError::UnknownNode(seed.to_string()));
        }
        Ok(MemoryClusterConn {
            state: Arc::clone(&self.state),
        })
    }

    async fn connect_node(
        &self,
        _endpoint: &ClusterEndpoint,
        node: &NodeAddr,
    ) -> Result<MemoryNodeConn, StoreError> {
        let node_idx = self
            .state
            .lock()
            .node_index(node)
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))?;
        Ok(MemoryNodeConn {
            state: Arc::clone(&self.state),
            node_idx,
        })
    }
}

/// Slot-routed connection to a [`MemoryCluster`]
#[derive(Debug)]
pub struct MemoryClusterConn {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl ClusterStore for MemoryClusterConn {
    async fn ping(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn cluster_nodes(&mut self) -> Result<TopologyReply, StoreError> {
        Ok(self.state.lock().topology())
    }

    async fn pttl(&mut self, key: &[u8]) -> Result<i64, StoreError> {
        Ok(self.state.lock().pttl(key))
    }

    async fn ttl(&mut self, key: &[u8]) -> Result<i64, StoreError> {
        let ms = self.state.lock().pttl(key);
        if ms < 0 {
            return Ok(ms);
        }
        Ok((ms + 500) / 1000)
    }

    async fn dump(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.state.lock();
        state.interfere(key, Interference::DeleteBeforeDump);
        match state.live(key) {
            Some(entry) => encode_payload(&entry.value).map(Some),
            None => Ok(None),
        }
    }

    async fn replace_from_snapshot(
        &mut self,
        key: &[u8],
        ttl_ms: i64,
        snapshot: &[u8],
    ) -> Result<(), StoreError> {
        let rejected = |message: &str| StoreError::Rejected {
            key: String::from_utf8_lossy(key).into_owned(),
            message: message.to_string(),
        };

        let mut state = self.state.lock();
        state.entries.remove(key);

        if ttl_ms < 0 {
            return Err(rejected("ERR Invalid TTL value, must be >= 0"));
        }
        let value = decode_payload(snapshot)
            .ok_or_else(|| rejected("ERR DUMP payload version or checksum are wrong"))?;
        if state.live(key).is_some() {
            return Err(rejected("BUSYKEY Target key name already exists."));
        }

        let expires_at =
            (ttl_ms > 0).then(|| Instant::now() + Duration::from_millis(ttl_ms as u64));
        state
            .entries
            .insert(key.to_vec(), Entry { value, expires_at });
        Ok(())
    }

    async fn key_type(&mut self, key: &[u8]) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.interfere(key, Interference::DeleteBeforeType);
        Ok(state
            .live(key)
            .map_or("none", |e| e.value.type_name())
            .to_string())
    }

    async fn read_value(
        &mut self,
        key: &[u8],
        kind: KeyType,
    ) -> Result<Option<KeyValue>, StoreError> {
        let mut state = self.state.lock();
        let rejects = state.interference.get(key) == Some(&Interference::RejectReads);
        let Some(entry) = state.live(key) else {
            return Ok(None);
        };
        match entry.value.to_value() {
            Some(value) if value.kind() == kind && !rejects => Ok(Some(value)),
            _ => Err(StoreError::Rejected {
                key: String::from_utf8_lossy(key).into_owned(),
                message: "WRONGTYPE Operation against a key holding the wrong kind of value"
                    .to_string(),
            }),
        }
    }
}

/// Direct connection to one node of a [`MemoryCluster`]
#[derive(Debug)]
pub struct MemoryNodeConn {
    state: Arc<Mutex<ClusterState>>,
    node_idx: usize,
}

#[async_trait]
impl NodeScanner for MemoryNodeConn {
    async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<Vec<u8>>), StoreError> {
        let now = Instant::now();
        let state = self.state.lock();
        let node = &state.nodes[self.node_idx];

        let local: Vec<&Vec<u8>> = state
            .entries
            .iter()
            .filter(|(key, entry)| {
                !entry.is_expired(now)
                    && node.serves(hash_slot(key))
                    && glob_match(pattern.as_bytes(), key)
            })
            .map(|(key, _)| key)
            .collect();

        let start = usize::try_from(cursor).unwrap_or(usize::MAX).min(local.len());
        let end = start.saturating_add(count.max(1)).min(local.len());
        let keys = local[start..end].iter().map(|k| (*k).clone()).collect();
        let next = if end >= local.len() { 0 } else { end as u64 };

        Ok((next, keys))
    }
}

/// Several [`MemoryCluster`]s behind one connector, routed by seed address
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    clusters: Vec<MemoryCluster>,
}

impl MemoryNetwork {
    pub fn new(clusters: impl IntoIterator<Item = MemoryCluster>) -> Self {
        Self {
            clusters: clusters.into_iter().collect(),
        }
    }

    fn route(&self, endpoint: &ClusterEndpoint) -> Result<&MemoryCluster, StoreError> {
        let seed = NodeAddr::new(endpoint.host.clone(), endpoint.port);
        self.clusters
            .iter()
            .find(|c| c.state.lock().node_index(&seed).is_some())
            .ok_or_else(|| StoreError::UnknownNode(seed.to_string()))
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    type Cluster = MemoryClusterConn;
    type Node = MemoryNodeConn;

    async fn connect_cluster(
        &self,
        endpoint: &ClusterEndpoint,
    ) -> Result<MemoryClusterConn, StoreError> {
        self.route(endpoint)?.connect_cluster(endpoint).await
    }

    async fn connect_node(
        &self,
        endpoint: &ClusterEndpoint,
        node: &NodeAddr,
    ) -> Result<MemoryNodeConn, StoreError> {
        self.route(endpoint)?.connect_node(endpoint, node).await
    }
}
