use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::TaskHandler;
use crate::engine::vu::{run_virtual_user, IterationBudget};
use crate::engine::{EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// Each stage ramps the active VU count towards `target` (clamped to
/// `max_vus`) over `duration_ms`, holding that count for the remainder of
/// the stage. A stage that asks for fewer VUs than are currently active
/// cancels the surplus immediately rather than waiting for them to finish
/// their current iteration. VUs added by a later stage run for the rest of
/// the task's total duration.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    if task.options.stages.is_empty() {
        return Err(Error::Validation("ramping_vus requires at least one stage".to_string()));
    }

    let max_vus = task.options.max_vus.unwrap_or(u32::MAX);
    let total_duration: u64 = task.options.stages.iter().map(|s| s.duration_ms).sum();
    let mut join_set: JoinSet<()> = JoinSet::new();
    let mut vu_tokens: Vec<CancellationToken> = Vec::new();
    let mut elapsed_before_stage = 0u64;

    for stage in &task.options.stages {
        if handle.cancel_token.is_cancelled() {
            break;
        }
        let target = stage.target.min(max_vus);
        let spawned_vus = vu_tokens.len() as u32;
        if target > spawned_vus {
            let remaining_total = total_duration.saturating_sub(elapsed_before_stage);
            for _ in spawned_vus..target {
                let child = handle.cancel_token.child_token();
                spawn_vu(task, handler.clone(), handle, event_tx, child.clone(), remaining_total, &mut join_set);
                vu_tokens.push(child);
            }
        } else if target < spawned_vus {
            for _ in target..spawned_vus {
                if let Some(surplus) = vu_tokens.pop() {
                    surplus.cancel();
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(stage.duration_ms)) => {}
            _ = handle.cancel_token.cancelled() => {}
        }
        elapsed_before_stage += stage.duration_ms;
    }

    while join_set.join_next().await.is_some() {}
    Ok(())
}

fn spawn_vu(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
    run_for_ms: u64,
    join_set: &mut JoinSet<()>,
) {
    let task = task.clone();
    let handle = handle.clone();
    let event_tx = event_tx.clone();
    let budget = IterationBudget::Duration(std::time::Duration::from_millis(run_for_ms.max(1)));
    join_set.spawn(async move {
        run_virtual_user(&task, handler, &handle, &event_tx, cancel, budget).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_stages(stages: Vec<crate::model::Stage>) -> Task {
        Task {
            task_id: "t1".to_string(),
            execution_id: "e1".to_string(),
            workflow: serde_json::json!({"steps": []}),
            segment: crate::model::Segment::full(),
            options: crate::model::TaskOptions {
                vus: 0,
                duration_ms: None,
                iterations: None,
                mode: crate::model::ExecutionMode::RampingVus,
                stages,
                max_vus: None,
                pre_allocated_vus: None,
            },
            variables: Default::default(),
        }
    }

    fn task_with_stages_and_max_vus(stages: Vec<crate::model::Stage>, max_vus: u32) -> Task {
        let mut task = task_with_stages(stages);
        task.options.max_vus = Some(max_vus);
        task
    }

    #[tokio::test]
    async fn no_stages_is_rejected() {
        let task = task_with_stages(vec![]);
        let handle = EngineHandle::new_for_test();
        let (tx, _rx) = mpsc::channel(8);
        let result = super::run(&task, Arc::new(NoopHandler), &handle, &tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ramps_up_and_completes_all_stages() {
        let task = task_with_stages(vec![
            crate::model::Stage { duration_ms: 0, target: 2 },
            crate::model::Stage { duration_ms: 0, target: 4 },
        ]);
        let handle = EngineHandle::new_for_test();
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = super::run(&task, Arc::new(NoopHandler), &handle, &tx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ramp_down_cancels_surplus_vus() {
        let task = task_with_stages(vec![
            crate::model::Stage { duration_ms: 20, target: 4 },
            crate::model::Stage { duration_ms: 0, target: 1 },
        ]);
        let handle = EngineHandle::new_for_test();
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = super::run(&task, Arc::new(NoopHandler), &handle, &tx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stage_target_is_clamped_to_max_vus() {
        let task = task_with_stages_and_max_vus(
            vec![crate::model::Stage { duration_ms: 0, target: 10 }],
            3,
        );
        let handle = EngineHandle::new_for_test();
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = super::run(&task, Arc::new(NoopHandler), &handle, &tx).await;
        assert!(result.is_ok());
        assert!(handle.active_vu_count() <= 3);
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute_step(
            &self,
            _step: &serde_json::Value,
            _variables: &std::collections::HashMap<String, serde_json::Value>,
        ) -> Result<crate::client::StepOutcome, Error> {
            Ok(crate::client::StepOutcome {
                step_id: "noop".to_string(),
                duration_ms: 0.0,
                success: true,
                status_code: None,
            })
        }
    }
}
