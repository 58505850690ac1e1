//! Cluster endpoints and verify configuration
//!
//! The verifier takes its two cluster references from a YAML file, from the
//! command line, or from the defaults below. Nothing connects until
//! [`crate::verify::verify`] is called with a resolved [`VerifyConfig`].

use crate::error::ConfigError;
use crate::topology::NodeAddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Default TTL skew tolerated between source and target, in seconds
pub const DEFAULT_TTL_TOLERANCE_SECS: i64 = 10;

/// Default `COUNT` hint for node-local scans
pub const DEFAULT_SCAN_BATCH: usize = 100;

/// Seed address of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ClusterEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
        }
    }

    /// Connection URL of the seed node
    pub fn url(&self) -> String {
        self.node_url(&NodeAddr::new(self.host.clone(), self.port))
    }

    /// Connection URL of another node of the same cluster, sharing credentials
    pub fn node_url(&self, node: &NodeAddr) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}", password, node.host, node.port),
            None => format!("redis://{}:{}", node.host, node.port),
        }
    }
}

impl fmt::Display for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ClusterEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidEndpoint(s.to_string()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

/// Verify configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    pub source: ClusterEndpoint,
    pub target: ClusterEndpoint,
    #[serde(default = "default_ttl_tolerance")]
    pub ttl_tolerance_secs: i64,
    #[serde(default = "default_scan_batch")]
    pub scan_batch: usize,
}

fn default_ttl_tolerance() -> i64 {
    DEFAULT_TTL_TOLERANCE_SECS
}

fn default_scan_batch() -> usize {
    DEFAULT_SCAN_BATCH
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            source: ClusterEndpoint::new("source-redis-node-0", 8000),
            target: ClusterEndpoint::new("target-redis-node-0", 7006),
            ttl_tolerance_secs: DEFAULT_TTL_TOLERANCE_SECS,
            scan_batch: DEFAULT_SCAN_BATCH,
        }
    }
}

impl VerifyConfig {
    pub fn new(source: ClusterEndpoint, target: ClusterEndpoint) -> Self {
        Self {
            source,
            target,
            ..Self::default()
        }
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: VerifyConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_tolerance_secs < 0 {
            return Err(ConfigError::Invalid(format!(
                "ttl_tolerance_secs must not be negative (got {})",
                self.ttl_tolerance_secs
            )));
        }
        if self.scan_batch == 0 {
            return Err(ConfigError::Invalid(
                "scan_batch must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
