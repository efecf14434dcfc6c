pub mod constant_arrival_rate;
pub mod constant_vus;
pub mod per_vu_iterations;
pub mod ramping_arrival_rate;
pub mod ramping_vus;
pub mod shared_iterations;
pub mod vu;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::client::TaskHandler;
use crate::error::Error;
use crate::metrics::StreamingAggregator;
use crate::model::{ExecutionMode, Task};

/// Lifecycle state shared by every load-shape engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl Default for EngineStatus {
    fn default() -> Self {
        EngineStatus::Idle
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineStatus::Idle => "idle",
            EngineStatus::Running => "running",
            EngineStatus::Stopping => "stopping",
            EngineStatus::Stopped => "stopped",
        };
        write!(f, "{label}")
    }
}

impl EngineStatus {
    pub fn can_transition_to(&self, next: EngineStatus) -> bool {
        use EngineStatus::*;
        matches!(
            (self, next),
            (Idle, Running) | (Running, Stopping) | (Stopping, Stopped)
        )
    }
}

/// Event stream emitted by a running engine. The master-side aggregation
/// loop (and, locally, any test harness) consumes these from the channel
/// passed to `run_task`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StepResult {
        step_id: String,
        duration_ms: f64,
        success: bool,
    },
    Progress {
        active_vus: u32,
        completed_iterations: u64,
    },
    StatusChange(EngineStatus),
    Complete {
        summary: crate::metrics::MetricsSummary,
    },
}

/// Handle to a running engine instance: lets a caller observe status and
/// request cancellation without holding onto the spawned task itself.
#[derive(Clone)]
pub struct EngineHandle {
    pub cancel_token: CancellationToken,
    pub status: Arc<RwLock<EngineStatus>>,
    pub aggregator: Arc<Mutex<StreamingAggregator>>,
    active_vus: Arc<AtomicU32>,
    completed_iterations: Arc<std::sync::atomic::AtomicU64>,
}

impl EngineHandle {
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new()
    }

    fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            status: Arc::new(RwLock::new(EngineStatus::Idle)),
            aggregator: Arc::new(Mutex::new(StreamingAggregator::new(1000))),
            active_vus: Arc::new(AtomicU32::new(0)),
            completed_iterations: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub async fn current_status(&self) -> EngineStatus {
        *self.status.read().await
    }

    async fn set_status(&self, next: EngineStatus) {
        let mut status = self.status.write().await;
        if status.can_transition_to(next) {
            *status = next;
        }
    }

    pub fn active_vu_count(&self) -> u32 {
        self.active_vus.load(Ordering::Relaxed)
    }

    pub fn completed_iteration_count(&self) -> u64 {
        self.completed_iterations.load(Ordering::Relaxed)
    }
}

/// Dispatch `task` to the load-shape engine named by `task.options.mode`,
/// spawning it onto the current runtime and returning immediately with a
/// handle the caller uses to observe progress or stop it early.
pub fn run_task(
    task: Task,
    handler: Arc<dyn TaskHandler>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> EngineHandle {
    let handle = EngineHandle::new();
    let spawned = handle.clone();

    tokio::spawn(async move {
        spawned.set_status(EngineStatus::Running).await;
        let _ = event_tx.send(EngineEvent::StatusChange(EngineStatus::Running)).await;

        let result = match task.options.mode {
            ExecutionMode::ConstantVus => {
                constant_vus::run(&task, handler, &spawned, &event_tx).await
            }
            ExecutionMode::RampingVus => {
                ramping_vus::run(&task, handler, &spawned, &event_tx).await
            }
            ExecutionMode::ConstantArrivalRate => {
                constant_arrival_rate::run(&task, handler, &spawned, &event_tx).await
            }
            ExecutionMode::RampingArrivalRate => {
                ramping_arrival_rate::run(&task, handler, &spawned, &event_tx).await
            }
            ExecutionMode::PerVuIterations => {
                per_vu_iterations::run(&task, handler, &spawned, &event_tx).await
            }
            ExecutionMode::SharedIterations => {
                shared_iterations::run(&task, handler, &spawned, &event_tx).await
            }
        };

        if let Err(err) = result {
            tracing::warn!(error = %err, task_id = %task.task_id, "engine run ended with error");
        }

        spawned.set_status(EngineStatus::Stopping).await;
        let _ = event_tx.send(EngineEvent::StatusChange(EngineStatus::Stopping)).await;

        let summary = spawned.aggregator.lock().await.summary();
        let _ = event_tx.send(EngineEvent::Complete { summary }).await;

        spawned.set_status(EngineStatus::Stopped).await;
        let _ = event_tx.send(EngineEvent::StatusChange(EngineStatus::Stopped)).await;
    });

    handle
}

pub(crate) fn record_step(
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
    outcome: &crate::client::StepOutcome,
    elapsed_ms: u64,
) {
    handle.completed_iterations.fetch_add(1, Ordering::Relaxed);
    let _ = event_tx.try_send(EngineEvent::StepResult {
        step_id: outcome.step_id.clone(),
        duration_ms: outcome.duration_ms,
        success: outcome.success,
    });
    if let Ok(mut aggregator) = handle.aggregator.try_lock() {
        aggregator.record(elapsed_ms, outcome.duration_ms, outcome.success);
    }
}

pub(crate) fn set_active_vus(handle: &EngineHandle, count: u32) {
    handle.active_vus.store(count, Ordering::Relaxed);
}

pub(crate) fn incr_active_vus(handle: &EngineHandle) -> u32 {
    handle.active_vus.fetch_add(1, Ordering::Relaxed) + 1
}

pub(crate) fn decr_active_vus(handle: &EngineHandle) -> u32 {
    handle.active_vus.fetch_sub(1, Ordering::Relaxed) - 1
}

/// Plan the tick cadence for an open-model arrival-rate target of `rate`
/// iterations/sec. `tokio::time::interval` has no sub-millisecond
/// resolution, so a naive `1/rate` interval silently degrades to a 1ms tick
/// once `rate` exceeds 1000/s. Instead of undershooting, widen the interval
/// to 1ms and fire enough tokens per tick to still hit the target rate.
pub(crate) fn tick_plan(rate: u32) -> (std::time::Duration, u32) {
    let rate = rate.max(1);
    let raw_interval_ms = 1000.0 / rate as f64;
    if raw_interval_ms >= 1.0 {
        (std::time::Duration::from_secs_f64(1.0 / rate as f64), 1)
    } else {
        let tokens_per_tick = (1.0 / raw_interval_ms).ceil() as u32;
        (std::time::Duration::from_millis(1), tokens_per_tick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_snake_case_labels() {
        assert_eq!(EngineStatus::Idle.to_string(), "idle");
        assert_eq!(EngineStatus::Running.to_string(), "running");
        assert_eq!(EngineStatus::Stopping.to_string(), "stopping");
        assert_eq!(EngineStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn legal_lifecycle_path() {
        assert!(EngineStatus::Idle.can_transition_to(EngineStatus::Running));
        assert!(EngineStatus::Running.can_transition_to(EngineStatus::Stopping));
        assert!(EngineStatus::Stopping.can_transition_to(EngineStatus::Stopped));
    }

    #[test]
    fn illegal_skip_from_idle_to_stopped() {
        assert!(!EngineStatus::Idle.can_transition_to(EngineStatus::Stopped));
    }

    #[test]
    fn default_is_idle() {
        assert_eq!(EngineStatus::default(), EngineStatus::Idle);
    }

    #[tokio::test]
    async fn handle_starts_idle_and_stops_cancels_token() {
        let handle = EngineHandle::new();
        assert_eq!(handle.current_status().await, EngineStatus::Idle);
        assert!(!handle.cancel_token.is_cancelled());
        handle.stop();
        assert!(handle.cancel_token.is_cancelled());
    }

    #[test]
    fn tick_plan_keeps_one_token_per_tick_under_1khz() {
        let (interval, tokens) = tick_plan(10);
        assert_eq!(tokens, 1);
        assert_eq!(interval, std::time::Duration::from_millis(100));
    }

    #[test]
    fn tick_plan_widens_interval_and_batches_tokens_above_1khz() {
        let (interval, tokens) = tick_plan(5000);
        assert_eq!(interval, std::time::Duration::from_millis(1));
        assert_eq!(tokens, 5);
    }

    #[test]
    fn tick_plan_treats_zero_rate_as_one() {
        let (interval, tokens) = tick_plan(0);
        assert_eq!(tokens, 1);
        assert_eq!(interval, std::time::Duration::from_secs(1));
    }
}
