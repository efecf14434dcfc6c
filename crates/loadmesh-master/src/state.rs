use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use loadmesh_core::error::Error;
use loadmesh_core::model::Task;
use loadmesh_core::registry::Registry;
use loadmesh_core::transport::{Command, Envelope};
use tokio::sync::{mpsc, RwLock};

/// Per-connection outbound channel, keyed by slave id. Populated once a
/// slave's `Register` envelope arrives on either transport; the websocket
/// write pump and the HTTP-poll handler both drain from the same kind of
/// channel so the coordinator never needs to know which transport a given
/// slave is using.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    senders: Arc<RwLock<HashMap<String, mpsc::Sender<Envelope>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, slave_id: String, sender: mpsc::Sender<Envelope>) {
        self.senders.write().await.insert(slave_id, sender);
    }

    pub async fn remove(&self, slave_id: &str) {
        self.senders.write().await.remove(slave_id);
    }

    pub async fn send(&self, slave_id: &str, envelope: Envelope) -> Result<(), Error> {
        let senders = self.senders.read().await;
        let sender = senders
            .get(slave_id)
            .ok_or_else(|| Error::Connection(format!("no live connection for slave {slave_id}")))?;
        sender
            .send(envelope)
            .await
            .map_err(|_| Error::Connection(format!("connection to slave {slave_id} closed")))
    }
}

#[async_trait]
impl loadmesh_core::coordinator::CommandDispatcher for ConnectionTable {
    async fn dispatch_task(&self, slave_id: &str, task: Task) -> Result<(), Error> {
        self.send(slave_id, Envelope::TaskAssign(task)).await
    }

    async fn dispatch_command(&self, slave_id: &str, command: Command) -> Result<(), Error> {
        self.send(slave_id, Envelope::Command(command)).await
    }
}

/// Shared application state handed to every axum handler.
pub struct AppState {
    pub registry: Registry,
    pub coordinator: loadmesh_core::coordinator::Coordinator,
    pub connections: ConnectionTable,
    pub config: loadmesh_core::config::MasterConfig,
}

pub type SharedState = Arc<AppState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_unknown_slave_errors() {
        let table = ConnectionTable::new();
        let result = table.send("ghost", Envelope::HeartbeatAck).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn insert_then_send_delivers_envelope() {
        let table = ConnectionTable::new();
        let (tx, mut rx) = mpsc::channel(4);
        table.insert("s1".to_string(), tx).await;
        table.send("s1", Envelope::HeartbeatAck).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, Envelope::HeartbeatAck));
    }

    #[tokio::test]
    async fn remove_forgets_connection() {
        let table = ConnectionTable::new();
        let (tx, _rx) = mpsc::channel(4);
        table.insert("s1".to_string(), tx).await;
        table.remove("s1").await;
        assert!(table.send("s1", Envelope::HeartbeatAck).await.is_err());
    }
}
