//! Cluster topology parsing
//!
//! `CLUSTER NODES` reaches us in one of two shapes depending on client and
//! server versions: the classic line-oriented text, or a structured mapping
//! keyed by `host:port`. Both are resolved here into one node list.

use crate::error::TopologyError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Raw topology reply as returned by a cluster connection
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyReply {
    /// One node per line: `<id> <ip:port@cport> <flags> <master> ...`
    Lines(String),
    /// Node entries keyed by `host:port`
    Structured(Vec<StructuredNode>),
}

/// One entry of the structured topology form
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredNode {
    /// `host:port` of the node
    pub address: String,
    /// Remaining fields (`flags`, `node_id`, `slots`, ...)
    pub fields: HashMap<String, String>,
}

/// Network address of a single cluster node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

impl NodeAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, ignoring any `@cport` bus suffix.
    pub fn parse(address: &str) -> Result<Self, TopologyError> {
        let address = address.split('@').next().unwrap_or(address);
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| TopologyError::InvalidAddress(address.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TopologyError::InvalidAddress(address.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Normalized node entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: String,
    pub addr: NodeAddr,
    /// Comma separated flags, e.g. `myself,master`
    pub flags: String,
}

impl ClusterNode {
    pub fn is_master(&self) -> bool {
        self.flags.contains("master")
    }
}

impl TopologyReply {
    /// Resolve either reply shape into a node list.
    pub fn into_nodes(self) -> Result<Vec<ClusterNode>, TopologyError> {
        match self {
            Self::Lines(text) => parse_lines(&text),
            Self::Structured(entries) => parse_structured(entries),
        }
    }
}

fn parse_lines(text: &str) -> Result<Vec<ClusterNode>, TopologyError> {
    let mut nodes = Vec::new();

    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        nodes.push(ClusterNode {
            id: parts[0].to_string(),
            addr: NodeAddr::parse(parts[1])?,
            flags: parts[2].to_string(),
        });
    }

    Ok(nodes)
}

fn parse_structured(entries: Vec<StructuredNode>) -> Result<Vec<ClusterNode>, TopologyError> {
    entries
        .into_iter()
        .map(|entry| {
            let addr = NodeAddr::parse(&entry.address)?;
            let id = entry
                .fields
                .get("node_id")
                .cloned()
                .unwrap_or_else(|| entry.address.clone());
            let flags = entry.fields.get("flags").cloned().unwrap_or_default();
            Ok(ClusterNode { id, addr, flags })
        })
        .collect()
}

/// Addresses of every node currently holding the master role
pub fn master_addrs(nodes: &[ClusterNode]) -> BTreeSet<NodeAddr> {
    nodes
        .iter()
        .filter(|node| node.is_master())
        .map(|node| node.addr.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_NODES: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004,node-4 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 127.0.0.1:30006@31006 slave 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_line_form_selects_masters() {
        let nodes = TopologyReply::Lines(CLUSTER_NODES.to_string())
            .into_nodes()
            .unwrap();
        assert_eq!(nodes.len(), 6);

        let masters = master_addrs(&nodes);
        let expected: BTreeSet<NodeAddr> = [30001, 30002, 30003]
            .into_iter()
            .map(|port| NodeAddr::new("127.0.0.1", port))
            .collect();
        assert_eq!(masters, expected);
    }

    #[test]
    fn test_line_form_skips_blank_and_short_lines() {
        let text = "\n\nabc 10.0.0.1:7000@17000\n  \n";
        let nodes = TopologyReply::Lines(text.to_string()).into_nodes().unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn test_line_form_rejects_bad_address() {
        let text = "abc not-an-address master - 0 0 1 connected";
        let result = TopologyReply::Lines(text.to_string()).into_nodes();
        assert!(matches!(result, Err(TopologyError::InvalidAddress(_))));
    }

    #[test]
    fn test_structured_form_selects_masters() {
        let entry = |address: &str, flags: &str| StructuredNode {
            address: address.to_string(),
            fields: HashMap::from([
                ("flags".to_string(), flags.to_string()),
                ("connected".to_string(), "True".to_string()),
            ]),
        };
        let reply = TopologyReply::Structured(vec![
            entry("10.0.0.1:7000", "myself,master"),
            entry("10.0.0.2:7001", "master"),
            entry("10.0.0.3:7002", "slave"),
            StructuredNode {
                address: "10.0.0.4:7003".to_string(),
                fields: HashMap::new(),
            },
        ]);

        let nodes = reply.into_nodes().unwrap();
        assert_eq!(nodes.len(), 4);
        assert_eq!(nodes[0].id, "10.0.0.1:7000");

        let masters: Vec<NodeAddr> = master_addrs(&nodes).into_iter().collect();
        assert_eq!(
            masters,
            vec![NodeAddr::new("10.0.0.1", 7000), NodeAddr::new("10.0.0.2", 7001)]
        );
    }

    #[test]
    fn test_node_addr_parse() {
        assert_eq!(
            NodeAddr::parse("redis-node-0:6379@16379").unwrap(),
            NodeAddr::new("redis-node-0", 6379)
        );
        assert_eq!(
            NodeAddr::parse("::1:7000").unwrap(),
            NodeAddr::new("::1", 7000)
        );
        assert!(NodeAddr::parse("redis-node-0").is_err());
        assert!(NodeAddr::parse("redis-node-0:port").is_err());
    }
}
