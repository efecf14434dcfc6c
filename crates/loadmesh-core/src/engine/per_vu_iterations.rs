use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::client::TaskHandler;
use crate::engine::vu::{run_virtual_user, IterationBudget};
use crate::engine::{EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// Each of `vus` virtual users runs exactly `iterations` iterations of the
/// workflow, independently of how long that takes — there is no shared
/// counter, so two VUs never race over who gets the next iteration.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    let vus = task.options.vus.max(1);
    let iterations = task
        .options
        .iterations
        .ok_or_else(|| Error::Validation("per_vu_iterations requires iterations".to_string()))?;

    let mut join_set: JoinSet<()> = JoinSet::new();
    for _ in 0..vus {
        let task = task.clone();
        let handler = handler.clone();
        let handle = handle.clone();
        let event_tx = event_tx.clone();
        let cancel = handle.cancel_token.clone();
        join_set.spawn(async move {
            run_virtual_user(&task, handler, &handle, &event_tx, cancel, IterationBudget::Count(iterations)).await;
        });
    }

    while join_set.join_next().await.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StepOutcome;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler(Arc<AtomicU32>);

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn execute_step(
            &self,
            _step: &serde_json::Value,
            _variables: &HashMap<String, serde_json::Value>,
        ) -> Result<StepOutcome, Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StepOutcome {
                step_id: "s".to_string(),
                duration_ms: 0.1,
                success: true,
                status_code: Some(200),
            })
        }
    }

    fn task_with(vus: u32, iterations: u64) -> Task {
        Task {
            task_id: "t1".to_string(),
            execution_id: "e1".to_string(),
            workflow: serde_json::json!({"steps": [{"id": "s", "method": "GET", "url": "http://x"}]}),
            segment: crate::model::Segment::full(),
            options: crate::model::TaskOptions {
                vus,
                duration_ms: None,
                iterations: Some(iterations),
                mode: crate::model::ExecutionMode::PerVuIterations,
                stages: vec![],
                max_vus: None,
                pre_allocated_vus: None,
            },
            variables: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn every_vu_runs_exact_iteration_count() {
        let task = task_with(4, 5);
        let calls = Arc::new(AtomicU32::new(0));
        let handle = EngineHandle::new_for_test();
        let (tx, _rx) = mpsc::channel(256);
        run(&task, Arc::new(CountingHandler(calls.clone())), &handle, &tx)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn missing_iterations_is_rejected() {
        let task = task_with(1, 0);
        let mut task = task;
        task.options.iterations = None;
        let handle = EngineHandle::new_for_test();
        let (tx, _rx) = mpsc::channel(8);
        let result = run(&task, Arc::new(CountingHandler(Arc::new(AtomicU32::new(0)))), &handle, &tx).await;
        assert!(result.is_err());
    }
}
