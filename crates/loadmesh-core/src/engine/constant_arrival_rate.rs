use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::client::TaskHandler;
use crate::engine::vu::workflow_steps;
use crate::engine::{decr_active_vus, incr_active_vus, record_step, set_active_vus, tick_plan, EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// Fires `vus` new iterations per second (`vus` here means target iterations
/// per second, the open-model analogue of a VU count) for `duration_ms`,
/// each iteration running independently of the others. Unlike the closed VU
/// models, an iteration that is still running when the next tick fires does
/// not delay that tick — this is the "arrival rate" contract: load is
/// driven by clock time, not by VU availability. When `max_vus` is set, a
/// tick that would exceed it is dropped rather than queued.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    let rate = task.options.vus.max(1);
    let duration = task
        .options
        .duration_ms
        .map(std::time::Duration::from_millis)
        .ok_or_else(|| Error::Validation("constant_arrival_rate requires duration_ms".to_string()))?;

    let (tick_interval, tokens_per_tick) = tick_plan(rate);
    let mut ticker = tokio::time::interval(tick_interval);
    let started = Instant::now();
    let mut join_set: JoinSet<()> = JoinSet::new();
    let semaphore = task.options.max_vus.map(|n| Arc::new(Semaphore::new(n as usize)));

    loop {
        if handle.cancel_token.is_cancelled() || started.elapsed() >= duration {
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
