use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::Error;
use crate::model::{Slave, SlaveInfo, SlaveStatus, Status};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Membership change pushed to `Registry::watch_slaves` subscribers. A
/// subscriber that falls behind the channel's capacity sees
/// `RecvError::Lagged` on its next `recv` rather than blocking the
/// registry — membership events are a best-effort stream, not a durable
/// log.
#[derive(Debug, Clone)]
pub enum SlaveEvent {
    Registered(SlaveInfo),
    Unregistered(String),
    Offline(String),
}

/// Shared, concurrently-accessed table of every slave the master currently
/// knows about. Cloning a `Registry` is cheap — it clones the `Arc` and the
/// broadcast sender handle.
#[derive(Clone)]
pub struct Registry {
    slaves: Arc<RwLock<HashMap<String, Slave>>>,
    events: broadcast::Sender<SlaveEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            slaves: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to slave registration/deregistration/offline events from
    /// this point forward. Each call gets its own independent receiver.
    pub fn watch_slaves(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    pub async fn register(&self, info: SlaveInfo) -> Slave {
        let slave = Slave {
            info: info.clone(),
            status: SlaveStatus::new_online(),
        };
        let mut slaves = self.slaves.write().await;
        slaves.insert(info.id.clone(), slave.clone());
        info!(slave_id = %info.id, "slave registered");
        let _ = self.events.send(SlaveEvent::Registered(info));
        slave
    }

    pub async fn deregister(&self, slave_id: &str) -> Option<Slave> {
        let mut slaves = self.slaves.write().await;
        let removed = slaves.remove(slave_id);
        if removed.is_some() {
            info!(slave_id, "slave deregistered");
            let _ = self.events.send(SlaveEvent::Unregistered(slave_id.to_string()));
        }
        removed
    }

    pub async fn heartbeat(&self, slave_id: &str, status: SlaveStatus) -> Result<(), Error> {
        let mut slaves = self.slaves.write().await;
        match slaves.get_mut(slave_id) {
            Some(slave) => {
                slave.status = status;
                Ok(())
            }
            None => Err(Error::NotFound(format!("slave {slave_id}"))),
        }
    }

    pub async fn set_status(&self, slave_id: &str, state: Status) -> Result<(), Error> {
        let mut slaves = self.slaves.write().await;
        match slaves.get_mut(slave_id) {
            Some(slave) => {
                slave.status.state = state;
                Ok(())
            }
            None => Err(Error::NotFound(format!("slave {slave_id}"))),
        }
    }

    pub async fn get(&self, slave_id: &str) -> Option<Slave> {
        self.slaves.read().await.get(slave_id).cloned()
    }

    pub async fn list(&self) -> Vec<Slave> {
        self.slaves.read().await.values().cloned().collect()
    }

    /// Mark as `offline` every slave whose `last_seen` is older than
    /// `timeout`. Called periodically by the master's sweeper task. Returns
    /// the ids transitioned.
    pub async fn sweep_stale(&self, timeout: chrono::Duration) -> Vec<String> {
        let now = Utc::now();
        let mut slaves = self.slaves.write().await;
        let mut transitioned = Vec::new();
        for (id, slave) in slaves.iter_mut() {
            if slave.status.state == Status::Online && now - slave.status.last_seen >= timeout {
                slave.status.state = Status::Offline;
                transitioned.push(id.clone());
            }
        }
        if !transitioned.is_empty() {
            warn!(count = transitioned.len(), "slaves marked offline by sweep");
            for id in &transitioned {
                let _ = self.events.send(SlaveEvent::Offline(id.clone()));
            }
        }
        transitioned
    }

    pub async fn len(&self) -> usize {
        self.slaves.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlaveType;
    use std::collections::{HashMap as Map, HashSet};

    fn info(id: &str) -> SlaveInfo {
        SlaveInfo {
            id: id.to_string(),
            slave_type: SlaveType::Worker,
            address: format!("{id}:9000"),
            capabilities: HashSet::new(),
            labels: Map::new(),
            resources: Default::default(),
        }
    }

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        let slave = registry.get("s1").await.unwrap();
        assert_eq!(slave.info.id, "s1");
        assert_eq!(slave.status.state, Status::Online);
    }

    #[tokio::test]
    async fn deregister_removes_slave() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        assert!(registry.deregister("s1").await.is_some());
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_on_unknown_slave_errors() {
        let registry = Registry::new();
        let result = registry.heartbeat("ghost", SlaveStatus::new_online()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn sweep_stale_marks_offline_past_timeout() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        let mut status = SlaveStatus::new_online();
        status.last_seen = Utc::now() - chrono::Duration::seconds(60);
        registry.heartbeat("s1", status).await.unwrap();

        let transitioned = registry.sweep_stale(chrono::Duration::seconds(30)).await;
        assert_eq!(transitioned, vec!["s1".to_string()]);
        assert_eq!(registry.get("s1").await.unwrap().status.state, Status::Offline);
    }

    #[tokio::test]
    async fn sweep_stale_leaves_fresh_slaves_online() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        let transitioned = registry.sweep_stale(chrono::Duration::seconds(30)).await;
        assert!(transitioned.is_empty());
        assert_eq!(registry.get("s1").await.unwrap().status.state, Status::Online);
    }

    #[tokio::test]
    async fn list_reflects_all_registered_slaves() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        registry.register(info("s2")).await;
        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn watch_slaves_emits_registered_and_unregistered() {
        let registry = Registry::new();
        let mut events = registry.watch_slaves();

        registry.register(info("s1")).await;
        match events.recv().await.unwrap() {
            SlaveEvent::Registered(i) => assert_eq!(i.id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }

        registry.deregister("s1").await;
        match events.recv().await.unwrap() {
            SlaveEvent::Unregistered(id) => assert_eq!(id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_slaves_emits_offline_on_sweep() {
        let registry = Registry::new();
        registry.register(info("s1")).await;
        let mut status = SlaveStatus::new_online();
        status.last_seen = Utc::now() - chrono::Duration::seconds(60);
        registry.heartbeat("s1", status).await.unwrap();

        let mut events = registry.watch_slaves();
        registry.sweep_stale(chrono::Duration::seconds(30)).await;
        match events.recv().await.unwrap() {
            SlaveEvent::Offline(id) => assert_eq!(id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
