use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::client::TaskHandler;
use crate::engine::vu::workflow_steps;
use crate::engine::{decr_active_vus, incr_active_vus, record_step, set_active_vus, tick_plan, EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// Like `constant_arrival_rate`, but the target iterations-per-second
/// changes stage by stage — `stage.target` is the rate for that stage,
/// `stage.duration_ms` how long it holds before moving to the next one.
/// `max_vus`, when set, bounds concurrently in-flight iterations across all
/// stages.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    if task.options.stages.is_empty() {
        return Err(Error::Validation(
            "ramping_arrival_rate requires at least one stage".to_string(),
        ));
    }

    let started = Instant::now();
    let mut join_set: JoinSet<()> = JoinSet::new();
    let semaphore = task.options.max_vus.map(|n| Arc::new(Semaphore::new(n as usize)));

    for stage in &task.options.stages {
        if handle.cancel_token.is_cancelled() {
            break;
        }
        let (tick_interval, tokens_per_tick) = tick_plan(stage.target);
        let mut ticker = tokio::time::interval(tick_interval);
        let stage_deadline = std::time::Duration::from_millis(stage.duration_ms);
        let stage_started = Instant::now();

        loop {
            if handle.cancel_token.is_cancelled() || stage_started.elapsed() >= stage_deadline {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    for _ in 0..tokens_per_tick {
                        spawn_iteration(task, handler.clone(), handle, event_tx, started, semaphore.clone(), &mut join_set);
                    }
                }
                _ = handle.cancel_token.cancelled() => break,
            }
        }
    }

    while join_set.join_next().await.is_some() {}
    set_active_vus(handle, 0);
    Ok(())
}

fn spawn_iteration(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
    started: Instant,
    semaphore: Option<Arc<Semaphore>>,
    join_set: &mut JoinSet<()>,
) {
    let permit = match semaphore {
        Some(sem) => match sem.try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => return,
        },
        None => None,
    };

    let steps = workflow_steps(&task.workflow);
    let variables = task.variables.clone();
    let handle = handle.clone();
    let event_tx = event_tx.clone();

    join_set.spawn(async move {
        let _permit = permit;
        incr_active_vus(&handle);
        for step in &steps {
            if let Ok(outcome) = handler.execute_step(step, &variables).await {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                record_step(&handle, &event_tx, &outcome, elapsed_ms);
            }
        }
        decr_active_vus(&handle);
    });
}
