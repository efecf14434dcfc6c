use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use loadmesh_core::model::{Status, SlaveExecutionState};
use loadmesh_core::transport::Envelope;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::SharedState;

const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub async fn handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_CHANNEL_CAPACITY);
    let mut slave_id: Option<String> = None;

    let write_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else { continue };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(%err, "websocket read error");
                break;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "dropping malformed envelope");
                continue;
            }
        };

        if let Some(reply) = handle_envelope(&state, &mut slave_id, envelope, &outbound_tx).await {
            if outbound_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    if let Some(id) = slave_id {
        state.connections.remove(&id).await;
        let _ = state.registry.set_status(&id, Status::Offline).await;
        info!(slave_id = %id, "slave connection closed");
    }
    write_task.abort();
}

async fn handle_envelope(
    state: &SharedState,
    slave_id: &mut Option<String>,
    envelope: Envelope,
    outbound_tx: &mpsc::Sender<Envelope>,
) -> Option<Envelope> {
    match envelope {
        Envelope::Register(info) => {
            let id = info.id.clone();
            state.registry.register(info).await;
            state.connections.insert(id.clone(), outbound_tx.clone()).await;
            *slave_id = Some(id.clone());
            info!(slave_id = %id, "slave registered over socket transport");
            Some(Envelope::RegisterAck { slave_id: id })
        }
        Envelope::Heartbeat(status) => {
            if let Some(id) = slave_id {
                if let Err(err) = state.registry.heartbeat(id, status).await {
                    warn!(%err, "heartbeat for unregistered slave");
                }
            }
            Some(Envelope::HeartbeatAck)
        }
        Envelope::Ping => Some(Envelope::Pong),
        Envelope::ResultBatch { results, metrics } => {
            info!(
                slave_id = ?slave_id,
                results = results.len(),
                metrics = metrics.len(),
                "received result batch"
            );
            None
        }
        Envelope::Progress { execution_id, slave_id, state: slave_state } => {
            apply_progress_update(state, &execution_id, &slave_id, slave_state).await;
            None
        }
        Envelope::TaskAck { task_id } => {
            info!(task_id, "slave acknowledged task");
            None
        }
        Envelope::CommandAck { command_id } => {
            info!(command_id, "slave acknowledged command");
            None
        }
        _ => None,
    }
}

/// Fold a slave-reported progress update (delivered out-of-band from the
/// envelope exchange above, e.g. via a REST callback) into the owning
/// execution's state.
pub async fn apply_progress_update(
    state: &SharedState,
    execution_id: &str,
    slave_id: &str,
    slave_state: SlaveExecutionState,
) {
    if let Err(err) = state
        .coordinator
        .record_slave_progress(execution_id, slave_id, slave_state)
        .await
    {
        warn!(%err, execution_id, slave_id, "failed to record slave progress");
    }
}
