use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::client::TaskHandler;
use crate::engine::vu::workflow_steps;
use crate::engine::{decr_active_vus, incr_active_vus, record_step, EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// `vus` virtual users draw from one shared pool of `iterations` total
/// iterations, each claiming the next iteration with a single
/// fetch-and-increment so the pool is exhausted exactly once no matter how
/// many VUs are racing for it.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    let vus = task.options.vus.max(1);
    let total_iterations = task
        .options
        .iterations
        .ok_or_else(|| Error::Validation("shared_iterations requires iterations".to_string()))?;

    let claimed = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let mut join_set: JoinSet<()> = JoinSet::new();

    for _ in 0..vus {
        let task = task.clone();
        let handler = handler.clone();
        let handle = handle.clone();
        let event_tx = event_tx.clone();
        let claimed = claimed.clone();
        let cancel = handle.cancel_token.clone();

        join_set.spawn(async move {
            incr_active_vus(&handle);
            let steps = workflow_steps(&task.workflow);
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let my_turn = claimed.fetch_add(1, Ordering::SeqCst);
                if my_turn >= total_iterations {
                    break;
                }
                for step in &steps {
                    if let Ok(outcome) = handler.execute_step(step, &task.variables).await {
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        record_step(&handle, &event_tx, &outcome, elapsed_ms);
                    }
                }
            }
            decr_active_vus(&handle);
        });
    }

    while join_set.join_next().await.is_some() {}
    Ok(())
}
