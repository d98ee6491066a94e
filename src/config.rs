use crate::id::{Zone, ID};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

/// Quorum system both phases are evaluated against.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumKind {
    /// A majority of all replicas for both phases.
    Majority,
    /// Site-aware grid: phase 1 spans zones, phase 2 stays within them.
    Grid,
}

/// Policy nominating a new leader from access-locality hits.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// `threshold` consecutive hits from a single site.
    Consecutive,
    /// A majority across a sliding window of `threshold` hits.
    Majority,
}

/// Error loading the configuration file. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// System configuration, loaded once at startup and read-only thereafter.
///
/// The JSON field names match the configuration files the deployment
/// tooling generates; absent fields fall back to the defaults below.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Replica-to-replica transport addresses.
    #[serde(rename = "address")]
    pub addrs: HashMap<ID, String>,
    /// Client-facing addresses.
    #[serde(rename = "http_address", default)]
    pub http_addrs: HashMap<ID, String>,
    /// Replication algorithm the node serves.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Quorum system for both phases.
    #[serde(default = "default_quorum")]
    pub quorum: QuorumKind,
    /// Failure-zone parameter of the grid quorum.
    #[serde(default)]
    pub f: usize,
    /// Reply to the client at commit instead of after execution.
    #[serde(default = "default_true")]
    pub reply_when_commit: bool,
    /// Adaptive leader placement.
    #[serde(default)]
    pub adaptive: bool,
    /// Leader handover policy; consulted only when `threshold > 0`.
    #[serde(default = "default_policy")]
    pub policy: Policy,
    /// Hits needed before the policy nominates a new leader. Zero disables
    /// leadership migration.
    #[serde(default)]
    pub threshold: usize,
    /// Base of the randomised retry backoff, in milliseconds.
    #[serde(default)]
    pub backoff: u64,
    /// Send phase 2 messages to a minimal quorum instead of the full site.
    #[serde(default)]
    pub thrifty: bool,
    /// Capacity hint for per-key maps.
    #[serde(default = "default_buffer")]
    pub buffer_size: usize,
    /// Capacity hint for transport channels.
    #[serde(default = "default_buffer")]
    pub chan_buffer_size: usize,
}

fn default_algorithm() -> String {
    "wpaxos".to_string()
}

fn default_quorum() -> QuorumKind {
    QuorumKind::Majority
}

fn default_policy() -> Policy {
    Policy::Consecutive
}

fn default_true() -> bool {
    true
}

fn default_buffer() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Config {
        Config {
            addrs: HashMap::new(),
            http_addrs: HashMap::new(),
            algorithm: default_algorithm(),
            quorum: default_quorum(),
            f: 0,
            reply_when_commit: true,
            adaptive: false,
            policy: default_policy(),
            threshold: 0,
            backoff: 0,
            thrifty: false,
            buffer_size: default_buffer(),
            chan_buffer_size: default_buffer(),
        }
    }
}

impl Config {
    /// Loads the configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        Config::from_reader(File::open(path)?)
    }

    /// Reads the configuration from any JSON source.
    pub fn from_reader<R: Read>(reader: R) -> Result<Config, ConfigError> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Number of replicas.
    pub fn n(&self) -> usize {
        self.addrs.len()
    }

    /// Number of distinct zones across the replica set.
    pub fn num_zones(&self) -> usize {
        let mut zones: Vec<Zone> = self.addrs.keys().map(|id| id.zone()).collect();
        zones.sort_unstable();
        zones.dedup();
        zones.len()
    }

    /// All replica identifiers, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = ID> + '_ {
        self.addrs.keys().copied()
    }

    /// Replica identifiers within one zone, sorted for deterministic
    /// selection.
    pub fn zone_ids(&self, zone: Zone) -> Vec<ID> {
        let mut ids: Vec<ID> = self.ids().filter(|id| id.zone() == zone).collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "address": {
            "1.1": "tcp://127.0.0.1:1735",
            "1.2": "tcp://127.0.0.1:1736",
            "2.1": "tcp://127.0.0.1:1737"
        },
        "http_address": {
            "1.1": "http://127.0.0.1:8080",
            "1.2": "http://127.0.0.1:8081",
            "2.1": "http://127.0.0.1:8082"
        },
        "quorum": "grid",
        "f": 1,
        "policy": "majority",
        "threshold": 3,
        "backoff": 100,
        "thrifty": true
    }"#;

    #[test]
    fn parses_deployment_file() {
        let config = Config::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(3, config.n());
        assert_eq!(2, config.num_zones());
        assert_eq!(QuorumKind::Grid, config.quorum);
        assert_eq!(1, config.f);
        assert_eq!(Policy::Majority, config.policy);
        assert_eq!(3, config.threshold);
        assert_eq!(100, config.backoff);
        assert!(config.thrifty);

        // defaults for everything the file omits
        assert_eq!("wpaxos", config.algorithm);
        assert!(config.reply_when_commit);
        assert!(!config.adaptive);
        assert_eq!(1024, config.buffer_size);
        assert_eq!(1024, config.chan_buffer_size);
    }

    #[test]
    fn zone_ids_are_sorted() {
        let config = Config::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(vec![ID::new(1, 1), ID::new(1, 2)], config.zone_ids(1));
        assert_eq!(vec![ID::new(2, 1)], config.zone_ids(2));
        assert!(config.zone_ids(3).is_empty());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            Config::from_reader(&b"{ \"address\": 5 }"[..]),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        let config = Config::from_reader(SAMPLE.as_bytes()).unwrap();
        let again = Config::from_reader(config.to_string().as_bytes()).unwrap();
        assert_eq!(config.addrs, again.addrs);
        assert_eq!(config.quorum, again.quorum);
        assert_eq!(config.threshold, again.threshold);
    }
}
