use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use loadmesh_core::buffer::{BufferedMetrics, BufferedResult, RingBuffer};
use loadmesh_core::client::{HttpTaskHandler, TaskHandler};
use loadmesh_core::config::SlaveConfig;
use loadmesh_core::engine::{self, EngineEvent, EngineStatus};
use loadmesh_core::model::execution::{SlaveExecutionMetrics, SlaveExecutionState, SlaveExecutionStatus};
use loadmesh_core::model::{SlaveInfo, SlaveResources, SlaveStatus, SlaveType};
use loadmesh_core::transport::{backoff_delay, Command, Envelope, SocketTransport};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Build the `SlaveInfo` this process advertises on registration. A
/// previously-assigned id is reused across reconnects so the master can
/// recognize the same physical slave after a transient disconnect.
pub fn build_slave_info(config: &SlaveConfig) -> SlaveInfo {
    SlaveInfo {
        id: config.slave_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
        slave_type: SlaveType::Worker,
        address: local_address_hint(),
        capabilities: config.capabilities.iter().cloned().collect(),
        labels: config.labels.clone(),
        resources: SlaveResources {
            cpu_cores: num_cpus_hint(),
            memory_mb: 0,
            max_vus: 0,
            current_load: 0.0,
        },
    }
}

fn local_address_hint() -> String {
    "unknown".to_string()
}

fn num_cpus_hint() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Connect, register, and run the heartbeat/task loop until the process is
/// told to stop. Reconnects with the shared backoff schedule on any
/// transport failure; never returns on its own.
pub async fn run(config: SlaveConfig) {
    let info = build_slave_info(&config);
    let mut attempt: u32 = 0;
    let handler: Arc<dyn TaskHandler> = match HttpTaskHandler::new() {
        Ok(handler) => Arc::new(handler),
        Err(err) => {
            error!(%err, "failed to build task handler, slave cannot start");
            return;
        }
    };
    // Held across reconnects so a transient disconnect never drops results
    // or metrics that were already buffered for the next flush.
    let result_buffer = Arc::new(Mutex::new(RingBuffer::<BufferedResult>::new(config.buffer_capacity)));
    let metrics_buffer = Arc::new(Mutex::new(RingBuffer::<BufferedMetrics>::new(config.buffer_capacity)));

    loop {
        match run_session(&config, info.clone(), handler.clone(), &result_buffer, &metrics_buffer).await {
            Ok(()) => {
                info!("session ended cleanly, reconnecting");
                attempt = 0;
            }
            Err(err) => {
                warn!(%err, attempt, "session failed, backing off before reconnect");
                attempt += 1;
            }
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

async fn run_session(
    config: &SlaveConfig,
    info: SlaveInfo,
    handler: Arc<dyn TaskHandler>,
    result_buffer: &Arc<Mutex<RingBuffer<BufferedResult>>>,
    metrics_buffer: &Arc<Mutex<RingBuffer<BufferedMetrics>>>,
) -> Result<(), loadmesh_core::Error> {
    let url = format!("ws://{}/ws", config.master_address);
    let mut transport = SocketTransport::connect(&url).await?;
    transport.send(Envelope::Register(info.clone())).await?;

    let slave_id = match transport.recv().await {
        Some(Envelope::RegisterAck { slave_id }) => slave_id,
        Some(_) | None => return Err(loadmesh_core::Error::Connection("registration rejected".to_string())),
    };
    info!(slave_id, "registered with master");

    let mut active_tasks: HashMap<String, loadmesh_core::engine::EngineHandle> = HashMap::new();

    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(config.heartbeat_interval_secs));
    let mut flush = tokio::time::interval(std::time::Duration::from_millis(config.flush_interval_ms));
    let (progress_tx, mut progress_rx) = mpsc::channel::<Envelope>(64);

    loop {
        tokio::select! {
            maybe_envelope = transport.recv() => {
                match maybe_envelope {
                    Some(envelope) => {
                        handle_envelope(envelope, &info.id, &handler, &mut active_tasks, &result_buffer, &metrics_buffer, &progress_tx, &mut transport).await?;
                    }
                    None => return Err(loadmesh_core::Error::Connection("socket closed by master".to_string())),
                }
            }
            Some(progress) = progress_rx.recv() => {
                transport.send(progress).await?;
            }
            _ = heartbeat.tick() => {
                let active = active_tasks.len() as u32;
                let mut status = SlaveStatus::new_online();
                status.active_tasks = active;
                transport.send(Envelope::Heartbeat(status)).await?;
            }
            _ = flush.tick() => {
                flush_buffers(&result_buffer, &metrics_buffer, &mut transport).await?;
            }
        }
    }
}

async fn handle_envelope(
    envelope: Envelope,
    slave_id: &str,
    handler: &Arc<dyn TaskHandler>,
    active_tasks: &mut HashMap<String, loadmesh_core::engine::EngineHandle>,
    result_buffer: &Arc<Mutex<RingBuffer<BufferedResult>>>,
    metrics_buffer: &Arc<Mutex<RingBuffer<BufferedMetrics>>>,
    progress_tx: &mpsc::Sender<Envelope>,
    transport: &mut SocketTransport,
) -> Result<(), loadmesh_core::Error> {
    match envelope {
        Envelope::TaskAssign(task) => {
            let task_id = task.task_id.clone();
            let execution_id = task.execution_id.clone();
            let segment = task.segment;
            let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(1024);
            let handle = engine::run_task(task, handler.clone(), event_tx);
            let handle_for_events = handle.clone();
            active_tasks.insert(task_id.clone(), handle);

            let result_buffer = result_buffer.clone();
            let metrics_buffer = metrics_buffer.clone();
            let progress_tx = progress_tx.clone();
            let slave_id = slave_id.to_string();
            tokio::spawn(async move {
                let started = Instant::now();
                let mut slave_state = SlaveExecutionState::new(segment);
                while let Some(event) = event_rx.recv().await {
                    match event {
                        EngineEvent::StepResult { step_id, duration_ms, success } => {
                            let entry = BufferedResult {
                                timestamp_ms: started.elapsed().as_millis() as u64,
                                duration_ms,
                                success,
                                status_code: None,
                                step_id,
                            };
                            result_buffer.lock().await.push(entry);
                        }
                        EngineEvent::StatusChange(EngineStatus::Running) => {
                            slave_state.status = SlaveExecutionStatus::Running;
                            send_progress(&progress_tx, &execution_id, &slave_id, slave_state.clone()).await;
                        }
                        EngineEvent::Progress { active_vus, completed_iterations } => {
                            slave_state.completed_vus = active_vus;
                            slave_state.completed_iterations = completed_iterations;
                            let summary = handle_for_events.aggregator.lock().await.summary();
                            metrics_buffer.lock().await.push(BufferedMetrics {
                                timestamp_ms: started.elapsed().as_millis() as u64,
                                active_vus,
                                rps: summary.rps,
                                p50_ms: summary.p50_ms,
                                p95_ms: summary.p95_ms,
                            });
                            send_progress(&progress_tx, &execution_id, &slave_id, slave_state.clone()).await;
                        }
                        EngineEvent::Complete { summary } => {
                            slave_state.status = SlaveExecutionStatus::Completed;
                            slave_state.metrics = SlaveExecutionMetrics {
                                requests: summary.total_requests,
                                failures: summary.total_failures,
                                p50_ms: summary.p50_ms,
                                p90_ms: summary.p90_ms,
                                p95_ms: summary.p95_ms,
                                p99_ms: summary.p99_ms,
                            };
                            send_progress(&progress_tx, &execution_id, &slave_id, slave_state.clone()).await;
                        }
                        EngineEvent::StatusChange(_) => {}
                    }
                }
            });

            transport.send(Envelope::TaskAck { task_id }).await?;
        }
        Envelope::Command(Command::Abort { command_id, .. }) => {
            for handle in active_tasks.values() {
                handle.stop();
            }
            transport.send(Envelope::CommandAck { command_id }).await?;
        }
        Envelope::Command(Command::Pause { command_id, .. } | Command::Resume { command_id, .. }) => {
            // Pause/resume of in-flight VUs is cooperative via the engine's
            // cancellation token only for abort; this ack simply confirms
            // receipt until step-level pause support lands.
            transport.send(Envelope::CommandAck { command_id }).await?;
        }
        Envelope::Command(Command::Scale { command_id, .. }) => {
            // A running engine's VU count is fixed for its lifetime (see
            // pause/resume above); rescaling takes effect on the next task
            // assignment rather than live-adjusting the active engine.
            transport.send(Envelope::CommandAck { command_id }).await?;
        }
        Envelope::Command(Command::Drain { command_id }) => {
            transport.send(Envelope::CommandAck { command_id }).await?;
        }
        Envelope::Ping => {
            transport.send(Envelope::Pong).await?;
        }
        Envelope::HeartbeatAck | Envelope::RegisterAck { .. } | Envelope::Pong => {}
        other => {
            warn!(?other, "unexpected envelope from master");
        }
    }
    Ok(())
}

async fn send_progress(
    progress_tx: &mpsc::Sender<Envelope>,
    execution_id: &str,
    slave_id: &str,
    state: SlaveExecutionState,
) {
    let envelope = Envelope::Progress {
        execution_id: execution_id.to_string(),
        slave_id: slave_id.to_string(),
        state,
    };
    if progress_tx.send(envelope).await.is_err() {
        warn!("progress channel closed, dropping update");
    }
}

/// Drain both buffers and ship them in one batch. A send failure (the
/// transport about to be torn down for reconnect) puts the drained items
/// back rather than losing them — they're re-queued ahead of whatever
/// arrived in the meantime, then trimmed back down to capacity exactly as a
/// fresh `push` would.
async fn flush_buffers(
    result_buffer: &Arc<Mutex<RingBuffer<BufferedResult>>>,
    metrics_buffer: &Arc<Mutex<RingBuffer<BufferedMetrics>>>,
    transport: &mut SocketTransport,
) -> Result<(), loadmesh_core::Error> {
    let results = result_buffer.lock().await.drain_all();
    let metrics = metrics_buffer.lock().await.drain_all();
    if results.is_empty() && metrics.is_empty() {
        return Ok(());
    }
    let batch = Envelope::ResultBatch { results: results.clone(), metrics: metrics.clone() };
    if let Err(err) = transport.send(batch).await {
        error!(%err, "failed to flush result batch, re-queuing");
        let mut result_guard = result_buffer.lock().await;
        for item in results {
            result_guard.push(item);
        }
        drop(result_guard);
        let mut metrics_guard = metrics_buffer.lock().await;
        for item in metrics {
            metrics_guard.push(item);
        }
        return Err(err);
    }
    Ok(())
}
