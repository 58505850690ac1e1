//! Error types for keyspace-migrate
//!
//! Leaf modules return these typed errors. Whole operations (dump, restore,
//! verify) wrap them in `anyhow` with context at their boundaries.

use thiserror::Error;

/// Record stream decoding and encoding errors
#[derive(Debug, Error)]
pub enum RecordError {
    /// Underlying file or stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended inside a record
    #[error("Truncated record: {field} needs {expected} bytes, only {actual} available")]
    Truncated {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    /// A key or snapshot does not fit the 32-bit length prefix
    #[error("{field} of {len} bytes exceeds the 32-bit length limit")]
    TooLarge { field: &'static str, len: usize },
}

/// Errors raised by a cluster store connection
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error from the Redis protocol layer
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store refused an operation on a single key
    #[error("{message}")]
    Rejected { key: String, message: String },

    /// A reply did not have the expected shape
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// No node listens on the requested address
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Topology reply could not be parsed
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
}

impl StoreError {
    /// Whether this error concerns a single key only.
    ///
    /// Server error replies (checksum mismatch, BUSYKEY, WRONGTYPE) and
    /// malformed replies are per-key. Everything else means the connection
    /// or the cluster is unusable.
    pub fn is_rejection(&self) -> bool {
        match self {
            Self::Redis(e) => matches!(
                e.kind(),
                redis::ErrorKind::ResponseError
                    | redis::ErrorKind::ExtensionError
                    | redis::ErrorKind::TypeError
            ),
            Self::Rejected { .. } | Self::UnexpectedReply(_) => true,
            Self::UnknownNode(_) | Self::Topology(_) => false,
        }
    }
}

/// Cluster topology parsing errors
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Invalid node address '{0}'")]
    InvalidAddress(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid cluster endpoint '{0}' (expected host:port)")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
