use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::TaskHandler;
use crate::engine::{decr_active_vus, incr_active_vus, record_step, EngineEvent, EngineHandle};
use crate::model::Task;

/// How long a single virtual user keeps iterating for.
#[derive(Debug, Clone, Copy)]
pub enum IterationBudget {
    Duration(std::time::Duration),
    Count(u64),
    Infinite,
}

/// Run one virtual user: repeatedly execute every step of the workflow
/// until `budget` is exhausted or `cancel` fires. The cancellation check
/// happens only between iterations, never mid-step, so an in-flight request
/// always finishes cleanly.
pub async fn run_virtual_user(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
    budget: IterationBudget,
) {
    incr_active_vus(handle);
    let started = Instant::now();
    let variables: HashMap<String, Value> = task.variables.clone();
    let steps = workflow_steps(&task.workflow);

    let mut iteration: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match budget {
            IterationBudget::Duration(limit) if started.elapsed() >= limit => break,
            IterationBudget::Count(limit) if iteration >= limit => break,
            _ => {}
        }

        for step in &steps {
            if let Ok(outcome) = handler.execute_step(step, &variables).await {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                record_step(handle, event_tx, &outcome, elapsed_ms);
            }
        }

        iteration += 1;
        let _ = event_tx
            .send(EngineEvent::Progress {
                active_vus: handle.active_vu_count(),
                completed_iterations: handle.completed_iteration_count(),
            })
            .await;
    }

    decr_active_vus(handle);
}

/// Extract the ordered list of workflow steps from the task's workflow
/// payload. Steps live under a top-level `steps` array; a workflow with no
/// such array is treated as having zero steps.
pub fn workflow_steps(workflow: &Value) -> Vec<Value> {
    workflow
        .get("steps")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}
