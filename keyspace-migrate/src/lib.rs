//! Key space migration for sharded key-value clusters
//!
//! Dumps every key of a cluster (opaque serialized value plus remaining TTL)
//! into a flat record stream, restores such a stream into another cluster,
//! and verifies that two clusters hold equivalent data.

pub mod config;
pub mod dump;
pub mod enumerate;
pub mod error;
pub mod progress;
pub mod record;
pub mod restore;
pub mod store;
pub mod topology;
pub mod verify;

// Re-export commonly used types
pub use config::{ClusterEndpoint, VerifyConfig};
pub use dump::{DumpOptions, DumpSummary, dump};
pub use error::{ConfigError, RecordError, StoreError, TopologyError};
pub use progress::Progress;
pub use record::{Record, StreamStats, inspect_stream, read_record, write_record};
pub use restore::{RestoreSummary, restore};
pub use store::{ClusterStore, Connector, KeyType, KeyValue, NodeScanner, RedisConnector};
pub use topology::{ClusterNode, NodeAddr, TopologyReply};
pub use verify::{Discrepancy, KeySpace, KeyState, VerifyReport, compare, verify};
