//! Cross-cluster equivalence verification
//!
//! Each cluster is materialized into a [`KeySpace`] (type, full value and
//! TTL of every key), then the two are compared. Every difference is
//! collected; nothing short-circuits except the per-key type check.

use crate::config::{ClusterEndpoint, VerifyConfig};
use crate::enumerate::{enumerate_masters, scan_all_keys};
use crate::error::StoreError;
use crate::store::{ClusterStore, Connector, KeyType, KeyValue, display_key};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Everything the verifier knows about one key
#[derive(Debug, Clone, PartialEq)]
pub struct KeyState {
    pub value: KeyValue,
    /// `TTL` reply in seconds; negative values mean no expiration
    pub ttl_secs: i64,
}

impl KeyState {
    pub fn kind(&self) -> KeyType {
        self.value.kind()
    }
}

/// Materialized key space of one cluster
pub type KeySpace = BTreeMap<Vec<u8>, KeyState>;

/// One difference between source and target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discrepancy {
    MissingInTarget {
        key: String,
    },
    ExtraInTarget {
        key: String,
    },
    TypeMismatch {
        key: String,
        source: KeyType,
        target: KeyType,
    },
    ValueMismatch {
        key: String,
        source: String,
        target: String,
    },
    TtlMismatch {
        key: String,
        source_ttl: i64,
        target_ttl: i64,
    },
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInTarget { key } => write!(f, "Key missing in target: {}", key),
            Self::ExtraInTarget { key } => write!(f, "Extra key in target: {}", key),
            Self::TypeMismatch {
                key,
                source,
                target,
            } => write!(
                f,
                "Type mismatch for key {}: source={}, target={}",
                key, source, target
            ),
            Self::ValueMismatch {
                key,
                source,
                target,
            } => write!(
                f,
                "Value mismatch for key {}:\n  Source: {}\n  Target: {}",
                key, source, target
            ),
            Self::TtlMismatch {
                key,
                source_ttl,
                target_ttl,
            } => write!(
                f,
                "TTL mismatch for key {}:\n  Source TTL: {}\n  Target TTL: {}",
                key, source_ttl, target_ttl
            ),
        }
    }
}

/// Whether two `TTL` replies agree, allowing for migration-time skew.
///
/// Non-positive values (no expiration, missing) are all treated alike.
pub fn ttl_consistent(source: i64, target: i64, tolerance_secs: i64) -> bool {
    (source <= 0 && target <= 0) || source.abs_diff(target) <= tolerance_secs.unsigned_abs()
}

/// Compare two key spaces.
///
/// Order of the result: keys missing in target, extra keys in target, then
/// per common key a type mismatch or any value and TTL mismatches.
pub fn compare(source: &KeySpace, target: &KeySpace, tolerance_secs: i64) -> Vec<Discrepancy> {
    let mut discrepancies = Vec::new();

    for key in source.keys().filter(|k| !target.contains_key(*k)) {
        discrepancies.push(Discrepancy::MissingInTarget {
            key: display_key(key).into_owned(),
        });
    }
    for key in target.keys().filter(|k| !source.contains_key(*k)) {
        discrepancies.push(Discrepancy::ExtraInTarget {
            key: display_key(key).into_owned(),
        });
    }

    for (key, src) in source {
        let Some(dst) = target.get(key) else {
            continue;
        };
        let key = display_key(key).into_owned();

        if src.kind() != dst.kind() {
            discrepancies.push(Discrepancy::TypeMismatch {
                key,
                source: src.kind(),
                target: dst.kind(),
            });
            continue;
        }

        if !src.value.equivalent(&dst.value) {
            discrepancies.push(Discrepancy::ValueMismatch {
                key: key.clone(),
                source: src.value.to_string(),
                target: dst.value.to_string(),
            });
        }

        if !ttl_consistent(src.ttl_secs, dst.ttl_secs, tolerance_secs) {
            discrepancies.push(Discrepancy::TtlMismatch {
                key,
                source_ttl: src.ttl_secs,
                target_ttl: dst.ttl_secs,
            });
        }
    }

    discrepancies
}

/// TTL of one expiring key on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TtlStat {
    pub key: String,
    pub source_ttl: i64,
    pub target_ttl: i64,
    pub difference: u64,
}

/// Outcome of a verification run
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub generated_at: DateTime<Utc>,
    pub source: String,
    pub target: String,
    pub source_keys: usize,
    pub target_keys: usize,
    pub discrepancies: Vec<Discrepancy>,
    /// Only filled in when there are no discrepancies
    pub ttl_stats: Vec<TtlStat>,
    pub keys_without_ttl: usize,
}

impl VerifyReport {
    pub fn build(
        config: &VerifyConfig,
        source: &KeySpace,
        target: &KeySpace,
        discrepancies: Vec<Discrepancy>,
    ) -> Self {
        let mut ttl_stats = Vec::new();
        if discrepancies.is_empty() {
            for (key, src) in source.iter().filter(|(_, s)| s.ttl_secs > 0) {
                let target_ttl = target.get(key).map_or(-2, |t| t.ttl_secs);
                ttl_stats.push(TtlStat {
                    key: display_key(key).into_owned(),
                    source_ttl: src.ttl_secs,
                    target_ttl,
                    difference: src.ttl_secs.abs_diff(target_ttl),
                });
            }
        }

        Self {
            generated_at: Utc::now(),
            source: config.source.to_string(),
            target: config.target.to_string(),
            source_keys: source.len(),
            target_keys: target.len(),
            keys_without_ttl: source.values().filter(|s| s.ttl_secs <= 0).count(),
            ttl_stats,
            discrepancies,
        }
    }

    pub fn is_success(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_success() {
            writeln!(f, "Verification failed!")?;
            for discrepancy in &self.discrepancies {
                writeln!(f, "Error: {}", discrepancy)?;
            }
            return Ok(());
        }

        writeln!(
            f,
            "Verification successful! Both clusters have {} keys with identical types and values.",
            self.source_keys
        )?;
        writeln!(f)?;
        writeln!(f, "TTL Statistics:")?;
        for stat in &self.ttl_stats {
            writeln!(f, "Key: {}", stat.key)?;
            writeln!(f, "  Source TTL: {} seconds", stat.source_ttl)?;
            writeln!(f, "  Target TTL: {} seconds", stat.target_ttl)?;
            writeln!(f, "  TTL Difference: {} seconds", stat.difference)?;
        }
        writeln!(f)?;
        writeln!(f, "Total keys with TTL: {}", self.ttl_stats.len())?;
        writeln!(f, "Keys without TTL: {}", self.keys_without_ttl)
    }
}

/// Read type, value and TTL of one key through the slot-routed connection.
///
/// `Ok(None)` when the key has a type the verifier does not read, or
/// vanished while being read.
pub async fn fetch_key_state<S: ClusterStore>(
    cluster: &mut S,
    key: &[u8],
) -> Result<Option<KeyState>, StoreError> {
    let type_name = cluster.key_type(key).await?;
    let kind = match type_name.parse::<KeyType>() {
        Ok(kind) => kind,
        Err(_) if type_name == "none" => {
            debug!("Key {} vanished before it could be read", display_key(key));
            return Ok(None);
        }
        Err(other) => {
            warn!("Unknown type {} for key {}", other, display_key(key));
            return Ok(None);
        }
    };

    let Some(value) = cluster.read_value(key, kind).await? else {
        debug!("Key {} vanished before it could be read", display_key(key));
        return Ok(None);
    };
    let ttl_secs = cluster.ttl(key).await?;

    Ok(Some(KeyState { value, ttl_secs }))
}

/// Enumerate and read the whole key space of one cluster.
pub async fn collect_keyspace<C: Connector>(
    connector: &C,
    endpoint: &ClusterEndpoint,
    scan_batch: usize,
) -> Result<KeySpace> {
    let mut cluster = connector
        .connect_cluster(endpoint)
        .await
        .with_context(|| format!("Failed to connect to cluster at {}", endpoint))?;
    cluster
        .ping()
        .await
        .with_context(|| format!("Cluster at {} did not answer PING", endpoint))?;

    let masters = enumerate_masters(&mut cluster).await?;
    let keys = scan_all_keys(connector, endpoint, &masters, scan_batch).await?;
    debug!("Enumerated {} keys on {}", keys.len(), endpoint);

    let mut keyspace = KeySpace::new();
    for key in keys {
        match fetch_key_state(&mut cluster, &key).await {
            Ok(Some(state)) => {
                keyspace.insert(key, state);
            }
            Ok(None) => {}
            Err(e) if e.is_rejection() => {
                warn!("Error getting value for key {}: {}", display_key(&key), e);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read key {} from {}", display_key(&key), endpoint)
                });
            }
        }
    }

    Ok(keyspace)
}

/// Verify that the target cluster holds the same key space as the source.
pub async fn verify<C: Connector>(connector: &C, config: &VerifyConfig) -> Result<VerifyReport> {
    config.validate().context("Invalid verify configuration")?;

    info!("Scanning source cluster keys...");
    let source = collect_keyspace(connector, &config.source, config.scan_batch)
        .await
        .context("Failed to read source cluster")?;
    info!("Found {} keys in source cluster", source.len());

    info!("Scanning target cluster keys...");
    let target = collect_keyspace(connector, &config.target, config.scan_batch)
        .await
        .context("Failed to read target cluster")?;
    info!("Found {} keys in target cluster", target.len());

    let discrepancies = compare(&source, &target, config.ttl_tolerance_secs);
    Ok(VerifyReport::build(config, &source, &target, discrepancies))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TTL_TOLERANCE_SECS;
    use crate::store::{Interference, MemoryCluster, MemoryNetwork};

    fn string(value: &str, ttl_secs: i64) -> KeyState {
        KeyState {
            value: KeyValue::String(value.as_bytes().to_vec()),
            ttl_secs,
        }
    }

    fn list(items: &[&str], ttl_secs: i64) -> KeyState {
        KeyState {
            value: KeyValue::List(items.iter().map(|s| s.as_bytes().to_vec()).collect()),
            ttl_secs,
        }
    }

    fn keyspace(entries: Vec<(&str, KeyState)>) -> KeySpace {
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect()
    }

    fn check(source: &KeySpace, target: &KeySpace) -> Vec<Discrepancy> {
        compare(source, target, DEFAULT_TTL_TOLERANCE_SECS)
    }

    #[test]
    fn test_set_difference() {
        let source = keyspace(vec![
            ("a", string("1", -1)),
            ("b", string("2", -1)),
            ("c", string("3", -1)),
        ]);
        let target = keyspace(vec![
            ("b", string("2", -1)),
            ("c", string("3", -1)),
            ("d", string("4", -1)),
        ]);

        assert_eq!(
            check(&source, &target),
            vec![
                Discrepancy::MissingInTarget {
                    key: "a".to_string()
                },
                Discrepancy::ExtraInTarget {
                    key: "d".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_list_order_is_ignored() {
        let source = keyspace(vec![("l", list(&["3", "1", "2"], -1))]);
        let target = keyspace(vec![("l", list(&["1", "2", "3"], -1))]);
        assert!(check(&source, &target).is_empty());
    }

    #[test]
    fn test_type_mismatch_stops_key_comparison() {
        let source = keyspace(vec![("k", string("1", 50))]);
        let target = keyspace(vec![("k", list(&["1"], 500))]);

        assert_eq!(
            check(&source, &target),
            vec![Discrepancy::TypeMismatch {
                key: "k".to_string(),
                source: KeyType::String,
                target: KeyType::List,
            }]
        );
    }

    #[test]
    fn test_value_and_ttl_mismatch_both_reported() {
        let source = keyspace(vec![("k", string("old", 50))]);
        let target = keyspace(vec![("k", string("new", 65))]);

        let found = check(&source, &target);
        assert_eq!(found.len(), 2);
        assert!(matches!(found[0], Discrepancy::ValueMismatch { .. }));
        assert_eq!(
            found[1],
            Discrepancy::TtlMismatch {
                key: "k".to_string(),
                source_ttl: 50,
                target_ttl: 65,
            }
        );
    }

    #[test]
    fn test_ttl_tolerance() {
        assert!(ttl_consistent(50, 55, 10));
        assert!(ttl_consistent(50, 60, 10));
        assert!(!ttl_consistent(50, 65, 10));
        assert!(!ttl_consistent(65, 50, 10));
        assert!(ttl_consistent(-1, -2, 10));
        assert!(ttl_consistent(0, -1, 10));
        assert!(!ttl_consistent(-1, 3600, 10));
        assert!(ttl_consistent(-1, 5, 10));
    }

    #[test]
    fn test_ttl_sentinels_compare_equal() {
        let source = keyspace(vec![("k", string("v", -1))]);
        let target = keyspace(vec![("k", string("v", -2))]);
        assert!(check(&source, &target).is_empty());
    }

    #[test]
    fn test_binary_keys_are_compared_by_bytes() {
        let mut source = KeySpace::new();
        source.insert(vec![b'k', 0xff], string("v", -1));
        let mut target = KeySpace::new();
        target.insert(vec![b'k', 0xfe], string("v", -1));

        // Both render as "k\u{fffd}" yet are different keys
        let found = check(&source, &target);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_report_statistics_on_success() {
        let source = keyspace(vec![("a", string("1", 50)), ("b", string("2", -1))]);
        let target = keyspace(vec![("a", string("1", 48)), ("b", string("2", -1))]);
        let discrepancies = check(&source, &target);

        let report = VerifyReport::build(&VerifyConfig::default(), &source, &target, discrepancies);
        assert!(report.is_success());
        assert_eq!(
            report.ttl_stats,
            vec![TtlStat {
                key: "a".to_string(),
                source_ttl: 50,
                target_ttl: 48,
                difference: 2,
            }]
        );
        assert_eq!(report.keys_without_ttl, 1);

        let text = report.to_string();
        assert!(text.starts_with("Verification successful! Both clusters have 2 keys"));
        assert!(text.contains("TTL Difference: 2 seconds"));
    }

    #[test]
    fn test_report_lists_every_discrepancy() {
        let source = keyspace(vec![("a", string("1", -1)), ("b", string("2", -1))]);
        let target = KeySpace::new();
        let discrepancies = check(&source, &target);

        let report = VerifyReport::build(&VerifyConfig::default(), &source, &target, discrepancies);
        assert!(!report.is_success());
        assert!(report.ttl_stats.is_empty());

        let text = report.to_string();
        assert!(text.starts_with("Verification failed!"));
        assert!(text.contains("Error: Key missing in target: a"));
        assert!(text.contains("Error: Key missing in target: b"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["discrepancies"][0]["kind"], "missing_in_target");
        assert_eq!(json["discrepancies"][1]["key"], "b");
    }

    fn mirrored_clusters(keys: &[&str]) -> (MemoryCluster, MemoryCluster) {
        let source = MemoryCluster::new("127.0.0.1", 7000, 2);
        let target = MemoryCluster::new("127.0.0.1", 8000, 2);
        for key in keys {
            let value = KeyValue::String(key.as_bytes().to_vec());
            source.insert(key, value.clone(), None);
            target.insert(key, value, None);
        }
        (source, target)
    }

    #[tokio::test]
    async fn test_rejected_read_excludes_key_and_continues() {
        let (source, target) = mirrored_clusters(&["a", "b", "c"]);
        source.interfere("b", Interference::RejectReads);

        let network = MemoryNetwork::new([source.clone(), target.clone()]);
        let config = VerifyConfig::new(source.seed_endpoint(), target.seed_endpoint());
        let report = verify(&network, &config).await.unwrap();

        assert_eq!(report.source_keys, 2);
        assert_eq!(report.target_keys, 3);
        assert_eq!(
            report.discrepancies,
            vec![Discrepancy::ExtraInTarget {
                key: "b".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_key_vanishing_before_type_read_is_excluded() {
        let (source, target) = mirrored_clusters(&["a", "b", "c"]);
        source.interfere("c", Interference::DeleteBeforeType);

        let network = MemoryNetwork::new([source.clone(), target.clone()]);
        let config = VerifyConfig::new(source.seed_endpoint(), target.seed_endpoint());
        let report = verify(&network, &config).await.unwrap();

        assert_eq!(report.source_keys, 2);
        assert_eq!(
            report.discrepancies,
            vec![Discrepancy::ExtraInTarget {
                key: "c".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_fetch_key_state_outcomes() {
        let (source, _) = mirrored_clusters(&["kept", "rejected", "gone"]);
        source.insert_opaque("events", "stream", b"opaque".to_vec());
        source.interfere("rejected", Interference::RejectReads);
        source.interfere("gone", Interference::DeleteBeforeType);
        let mut conn = source
            .connect_cluster(&source.seed_endpoint())
            .await
            .unwrap();

        let kept = fetch_key_state(&mut conn, b"kept").await.unwrap();
        assert_eq!(kept, Some(string("kept", -1)));
        assert!(fetch_key_state(&mut conn, b"gone").await.unwrap().is_none());
        assert!(fetch_key_state(&mut conn, b"events").await.unwrap().is_none());
        let err = fetch_key_state(&mut conn, b"rejected").await.unwrap_err();
        assert!(err.is_rejection());
    }
}
