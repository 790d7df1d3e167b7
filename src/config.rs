//! Cluster and replication configuration.
//!
//! Mirrors the `PRM_ID_HA_*` parameter family named in base spec §6: one
//! flat, serde-friendly struct, loaded from JSON and overridable by
//! environment variables, the way the teacher's `ReplicationConfig` /
//! `WalConfig` structs carry sensible production defaults and are validated
//! once at startup rather than re-checked on every access.

use crate::error::{Result, RyeError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn millis(m: u64) -> Duration {
    Duration::from_millis(m)
}

/// Full HA configuration for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HaConfig {
    /// This node's identity in the `node_list`.
    pub this_node: String,
    /// Ordered node list, priority 1..n (base spec §3 "Node").
    pub node_list: Vec<NodeEndpoint>,
    /// Distinguished replica-priority nodes.
    pub replica_list: Vec<NodeEndpoint>,
    /// External witnesses consulted during split-brain isolation checks.
    pub ping_hosts: Vec<String>,

    /// UDP gossip interval (`HEARTBEAT_INTERVAL`).
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    /// Period between score recalculations (`CALC_SCORE_INTERVAL`).
    #[serde(with = "duration_secs")]
    pub calc_score_interval: Duration,
    /// Consecutive missed rounds (or elapsed time) before a node is
    /// demoted to `unknown` (`MAX_HEARTBEAT_GAP`).
    pub max_heartbeat_gap: u32,
    /// Wait window for a failover decision.
    #[serde(with = "duration_secs")]
    pub failover_wait_time: Duration,
    /// Timer before the first election attempt after startup.
    #[serde(with = "duration_secs")]
    pub init_timer: Duration,

    /// Gap (since last registration) below which an unexpected
    /// disconnection demotes self before restarting the child
    /// (`UNACCEPTABLE_PROC_RESTART_TIMEDIFF`).
    #[serde(with = "duration_secs")]
    pub unacceptable_proc_restart_timediff: Duration,
    /// Unacknowledged changemode attempts before SIGTERM.
    pub max_changemode_diff_to_term: u32,
    /// Unacknowledged changemode attempts before SIGKILL.
    pub max_changemode_diff_to_kill: u32,
    /// Confirm-start retry ceiling for the resource manager.
    pub confirm_start_retry_limit: u32,
    /// Deregister confirm poll interval / count.
    #[serde(with = "duration_millis")]
    pub deregister_confirm_interval: Duration,
    pub deregister_confirm_count: u32,
    /// Disk-failure (EOF stall) check interval.
    #[serde(with = "duration_secs")]
    pub disk_failure_check_interval: Duration,

    /// Copier back-pressure queue depth (`HB_RECV_Q_MAX_COUNT`).
    pub hb_recv_q_max_count: usize,
    /// Analyzer page-read retry ceiling before restart
    /// (`LA_GET_PAGE_RETRY_COUNT`).
    pub la_get_page_retry_count: u32,
    /// Max committed transaction entries reclaimed per analyzer sweep
    /// (`MAX_COMMITTED_ARRAY`).
    pub max_committed_array: usize,
    /// Number of shard-keyed applier lanes, excluding DDL and global
    /// (lanes 2..N in the glossary).
    pub applier_shard_count: usize,
    /// Enable LZO-class compression on the copier's WAL-streaming RPC
    /// (implemented with `flate2`; see DESIGN.md).
    pub copier_compression: bool,

    /// Configured replica-delay window, if any (`HA_REPLICA_DELAY`).
    #[serde(with = "duration_millis_opt")]
    pub replica_delay: Option<Duration>,
    /// Hard bound past which the analyzer blocks entirely rather than
    /// catching up (base spec §4.10 step 5).
    #[serde(with = "duration_millis_opt")]
    pub replica_time_bound: Option<Duration>,

    pub log_page_size: usize,
    pub log_npages: u32,
    pub log_path: PathBuf,

    /// Suppresses forking into the background (`NO_DAEMON` env var).
    pub no_daemon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub name: String,
    pub addr: SocketAddr,
    pub priority: u32,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            this_node: String::new(),
            node_list: Vec::new(),
            replica_list: Vec::new(),
            ping_hosts: Vec::new(),
            heartbeat_interval: secs(1),
            calc_score_interval: secs(5),
            max_heartbeat_gap: 3,
            failover_wait_time: secs(3),
            init_timer: secs(5),
            unacceptable_proc_restart_timediff: secs(5),
            max_changemode_diff_to_term: 5,
            max_changemode_diff_to_kill: 10,
            confirm_start_retry_limit: 5,
            deregister_confirm_interval: millis(500),
            deregister_confirm_count: 10,
            disk_failure_check_interval: secs(5),
            hb_recv_q_max_count: 4096,
            la_get_page_retry_count: 100,
            max_committed_array: 1024,
            applier_shard_count: 4,
            copier_compression: true,
            replica_delay: None,
            replica_time_bound: None,
            log_page_size: 16 * 1024,
            log_npages: 8192,
            log_path: PathBuf::from("./rye_log"),
            no_daemon: std::env::var("NO_DAEMON").is_ok(),
        }
    }
}

impl HaConfig {
    /// Loads configuration from a JSON document, then applies the
    /// `NO_DAEMON` environment override and validates.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let mut cfg: HaConfig = serde_json::from_str(s)?;
        if std::env::var("NO_DAEMON").is_ok() {
            cfg.no_daemon = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.this_node.is_empty() {
            return Err(RyeError::Configuration("this_node must be set".into()));
        }
        if !self.node_list.iter().any(|n| n.name == self.this_node) {
            return Err(RyeError::Configuration(format!(
                "this_node '{}' is not present in node_list",
                self.this_node
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(RyeError::Configuration("heartbeat_interval must be > 0".into()));
        }
        if self.applier_shard_count == 0 {
            return Err(RyeError::Configuration("applier_shard_count must be > 0".into()));
        }
        if self.log_npages == 0 {
            return Err(RyeError::Configuration("log_npages must be > 0".into()));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let millis = d.map(|d| d.as_millis() as u64);
        Serialize::serialize(&millis, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let raw: Option<u64> = Option::deserialize(d)?;
        Ok(raw.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_fails_validation_without_this_node() {
        let cfg = HaConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_validates_when_this_node_is_listed() {
        let mut cfg = HaConfig::default();
        cfg.this_node = "node-a".into();
        cfg.node_list.push(NodeEndpoint {
            name: "node-a".into(),
            addr: "127.0.0.1:59901".parse().unwrap(),
            priority: 1,
        });
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = HaConfig::default();
        cfg.this_node = "node-a".into();
        cfg.node_list.push(NodeEndpoint {
            name: "node-a".into(),
            addr: "127.0.0.1:59901".parse().unwrap(),
            priority: 1,
        });
        let json = serde_json::to_string(&cfg).unwrap();
        let back = HaConfig::from_json_str(&json).unwrap();
        assert_eq!(back.this_node, "node-a");
        assert_eq!(back.heartbeat_interval, cfg.heartbeat_interval);
    }
}
