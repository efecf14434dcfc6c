use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::client::TaskHandler;
use crate::engine::vu::{run_virtual_user, IterationBudget};
use crate::engine::{EngineEvent, EngineHandle};
use crate::error::Error;
use crate::model::Task;

/// A fixed number of VUs runs continuously for `duration_ms`, each looping
/// its workflow until the duration elapses or the engine is cancelled.
pub async fn run(
    task: &Task,
    handler: Arc<dyn TaskHandler>,
    handle: &EngineHandle,
    event_tx: &mpsc::Sender<EngineEvent>,
) -> Result<(), Error> {
    let vus = task.options.vus.max(1);
    let duration = task
        .options
        .duration_ms
        .map(std::time::Duration::from_millis)
        .ok_or_else(|| Error::Validation("constant_vus requires duration_ms".to_string()))?;

    let mut join_set = JoinSet::new();
    for _ in 0..vus {
        let task = task.clone();
        let handler = handler.clone();
        let handle = handle.clone();
        let event_tx = event_tx.clone();
        let cancel = handle.cancel_token.clone();
        join_set.spawn(async move {
            run_virtual_user(&task, handler, &handle, &event_tx, cancel, IterationBudget::Duration(duration)).await;
        });
    }

    tokio::select! {
        _ = async { while join_set.join_next().await.is_some() {} } => {}
        _ = handle.cancel_token.cancelled() => {
            while join_set.join_next().await.is_some() {}
        }
    }

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

    fn task_with(vus: u32, duration_ms: u64) -> Task {
        Task {
            task_id: "t1".to_string(),
            execution_id: "e1".to_string(),
            workflow: serde_json::json!({"steps": [{"id": "s", "method": "GET", "url": "http://x"}]}),
            segment: crate::model::Segment::full(),
            options: crate::model::TaskOptions {
                vus,
                duration_ms: Some(duration_ms),
                iterations: None,
                mode: crate::model::ExecutionMode::ConstantVus,
                stages: vec![],
                max_vus: None,
                pre_allocated_vus: None,
            },
            variables: HashMap::new(),
        }
    }

    #[test]
    fn missing_duration_is_rejected() {
        let mut task = task_with(2, 1000);
        task.options.duration_ms = None;
        let handle = EngineHandle::new_for_test();
        let (tx, _rx) = mpsc::channel(8);
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(run(&task, Arc::new(CountingHandler(Arc::new(AtomicU32::new(0)))), &handle, &tx));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn runs_all_vus_until_duration_elapses() {
        let task = task_with(3, 200);
        let calls = Arc::new(AtomicU32::new(0));
        let handle = EngineHandle::new_for_test();
        let (tx, mut rx) = mpsc::channel(256);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        run(&task, Arc::new(CountingHandler(calls.clone())), &handle, &tx)
            .await
            .unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }
}
