use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SlaveType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveType {
    Worker,
    Gateway,
    Aggregator,
}

// ---------------------------------------------------------------------------
// SlaveResources
// ---------------------------------------------------------------------------

/// Capacity and current load reported by a slave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub max_vus: u32,
    /// Self-reported by the slave on heartbeat; the master never mutates it.
    pub current_load: f64,
}

// ---------------------------------------------------------------------------
// SlaveInfo — identity and capability, immutable except `resources`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub slave_type: SlaveType,
    pub address: String,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub resources: SlaveResources,
}

impl SlaveInfo {
    /// Required capabilities ⊆ this slave's capabilities.
    pub fn has_capabilities(&self, required: &HashSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// This slave's labels are a superset of `required`.
    pub fn has_labels(&self, required: &HashMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|existing| existing == v).unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Status / SlaveStatus — liveness snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Online,
    Offline,
    Busy,
    Draining,
    Maintenance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveMetrics {
    pub cpu: f64,
    pub memory: f64,
    pub active_vus: u32,
    pub throughput: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveStatus {
    pub state: Status,
    /// Load percentage in `[0, 100]`.
    pub load: f64,
    pub active_tasks: u32,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metrics: SlaveMetrics,
}

impl SlaveStatus {
    pub fn new_online() -> Self {
        Self {
            state: Status::Online,
            load: 0.0,
            active_tasks: 0,
            last_seen: Utc::now(),
            metrics: SlaveMetrics::default(),
        }
    }

    /// Healthy iff online and the time since `last_seen` is strictly less
    /// than `timeout` — a slave that reports exactly at the boundary is
    /// already considered stale.
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.state == Status::Online && (now - self.last_seen) < timeout
    }
}

/// A registered slave, combining its immutable identity with its mutable
/// liveness snapshot. Used for read views returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Slave {
    pub info: SlaveInfo,
    pub status: SlaveStatus,
}

/// The unique `task_id -> slave_id` id used by the registry/coordinator when
/// generating fresh slave ids on registration.
pub fn new_slave_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn info(caps: &[&str]) -> SlaveInfo {
        SlaveInfo {
            id: "s1".to_string(),
            slave_type: SlaveType::Worker,
            address: "127.0.0.1:9000".to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            labels: HashMap::new(),
            resources: SlaveResources::default(),
        }
    }

    #[test]
    fn has_capabilities_superset() {
        let s = info(&["http", "script", "grpc"]);
        let required: HashSet<String> = ["http", "script"].iter().map(|s| s.to_string()).collect();
        assert!(s.has_capabilities(&required));
    }

    #[test]
    fn has_capabilities_missing_one() {
        let s = info(&["http"]);
        let required: HashSet<String> = ["http", "script"].iter().map(|s| s.to_string()).collect();
        assert!(!s.has_capabilities(&required));
    }

    #[test]
    fn has_labels_matches_values_not_just_keys() {
        let mut s = info(&[]);
        s.labels.insert("region".to_string(), "us-east".to_string());
        let mut required = HashMap::new();
        required.insert("region".to_string(), "us-west".to_string());
        assert!(!s.has_labels(&required));
        required.insert("region".to_string(), "us-east".to_string());
        assert!(s.has_labels(&required));
    }

    // -----------------------------------------------------------------------
    // Health boundary
    // -----------------------------------------------------------------------

    #[test]
    fn healthy_strictly_inside_timeout() {
        let mut status = SlaveStatus::new_online();
        let now = Utc::now();
        status.last_seen = now - ChronoDuration::seconds(29);
        assert!(status.is_healthy(now, ChronoDuration::seconds(30)));
    }

    #[test]
    fn unhealthy_exactly_at_timeout() {
        let mut status = SlaveStatus::new_online();
        let now = Utc::now();
        status.last_seen = now - ChronoDuration::seconds(30);
        assert!(!status.is_healthy(now, ChronoDuration::seconds(30)));
    }

    #[test]
    fn unhealthy_when_offline_even_if_recent() {
        let mut status = SlaveStatus::new_online();
        status.state = Status::Offline;
        let now = Utc::now();
        status.last_seen = now;
        assert!(!status.is_healthy(now, ChronoDuration::seconds(30)));
    }

    #[test]
    fn slave_status_serde_roundtrip() {
        let status = SlaveStatus::new_online();
        let json = serde_json::to_string(&status).unwrap();
        let parsed: SlaveStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, status.state);
        assert_eq!(parsed.active_tasks, status.active_tasks);
    }
}
