use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::model::{
    ExecutionError, ExecutionState, ExecutionStatus, SlaveExecutionState, Task, TaskOptions,
};
use crate::registry::Registry;
use crate::scheduler::{self, SelectionCriteria};
use crate::transport::Command;

/// Seam between the coordinator and however slave connections are actually
/// held (websocket pumps on the master's connection table, or an HTTP-poll
/// outbox) so the coordinator itself never has to know about transports.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch_task(&self, slave_id: &str, task: Task) -> Result<(), Error>;
    async fn dispatch_command(&self, slave_id: &str, command: Command) -> Result<(), Error>;
}

/// Owns the map of in-flight and historical executions and drives each one
/// through its status lifecycle, fanning work out to slaves via a
/// `CommandDispatcher` and folding slave-reported progress back in.
#[derive(Clone)]
pub struct Coordinator {
    registry: Registry,
    dispatcher: Arc<dyn CommandDispatcher>,
    executions: Arc<RwLock<HashMap<String, ExecutionState>>>,
}

impl Coordinator {
    pub fn new(registry: Registry, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Schedule `workflow` onto eligible slaves per `criteria`, partition
    /// the workload, and push a `Task` to each selected slave. Fails with
    /// `Error::ResourceExhausted` if nothing matches, or if `Auto` mode's
    /// `min_slaves` floor isn't met.
    pub async fn start_execution(
        &self,
        workflow_id: impl Into<String>,
        workflow: serde_json::Value,
        options: TaskOptions,
        criteria: SelectionCriteria,
    ) -> Result<ExecutionState, Error> {
        let workflow_id = workflow_id.into();
        let slaves = self.registry.list().await;
        let infos: Vec<_> = slaves.iter().map(|s| s.info.clone()).collect();
        let statuses: HashMap<String, crate::model::Status> = slaves
            .iter()
            .map(|s| (s.info.id.clone(), s.status.state))
            .collect();

        let assignment = scheduler::schedule(&infos, &statuses, &criteria)
            .map_err(|err| Error::ResourceExhausted(err.to_string()))?;

        let execution_id = Uuid::new_v4().to_string();
        let mut state = ExecutionState::new(execution_id.clone(), workflow_id);
        state.workflow = workflow.clone();
        state.task_options = Some(options.clone());

        for (slave_info, segment) in &assignment {
            let task = Task {
                task_id: Uuid::new_v4().to_string(),
                execution_id: execution_id.clone(),
                workflow: workflow.clone(),
                segment: *segment,
                options: TaskOptions {
                    vus: Task::scaled_vus(options.vus, *segment),
                    duration_ms: options.duration_ms,
                    iterations: options
                        .iterations
                        .map(|total| Task::scaled_iterations(total, *segment)),
                    mode: options.mode,
                    stages: options.stages.clone(),
                    max_vus: options.max_vus,
                    pre_allocated_vus: options.pre_allocated_vus,
                },
                variables: HashMap::new(),
            };

            if let Err(err) = self.dispatcher.dispatch_task(&slave_info.id, task).await {
                warn!(slave_id = %slave_info.id, %err, "failed to dispatch task");
                state.record_error(
                    ExecutionError::from_error(&err).with_slave(slave_info.id.clone()),
                );
                continue;
            }
            state
                .slave_states
                .insert(slave_info.id.clone(), SlaveExecutionState::new(*segment));
        }

        if state.slave_states.is_empty() {
            return Err(Error::Execution("every slave dispatch failed".to_string()));
        }

        state.transition(ExecutionStatus::Running);
        info!(execution_id = %state.id, slaves = state.slave_states.len(), "execution started");

        self.executions.write().await.insert(state.id.clone(), state.clone());
        Ok(state)
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionState> {
        self.executions.read().await.get(execution_id).cloned()
    }

    pub async fn list(&self) -> Vec<ExecutionState> {
        self.executions.read().await.values().cloned().collect()
    }

    async fn broadcast_command(
        &self,
        execution_id: &str,
        next: ExecutionStatus,
        build_command: impl Fn(String) -> Command,
    ) -> Result<ExecutionState, Error> {
        let mut executions = self.executions.write().await;
        let state = executions
            .get_mut(execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

        if !state.transition(next) {
            return Err(Error::Conflict(format!(
                "cannot transition execution {execution_id} from {:?} to {:?}",
                state.status, next
            )));
        }

        let slave_ids: Vec<String> = state.slave_states.keys().cloned().collect();
        for slave_id in slave_ids {
            let command_id = Uuid::new_v4().to_string();
            if let Err(err) = self
                .dispatcher
                .dispatch_command(&slave_id, build_command(command_id))
                .await
            {
                state.record_error(ExecutionError::from_error(&err).with_slave(slave_id));
            }
        }

        Ok(state.clone())
    }

    pub async fn pause(&self, execution_id: &str) -> Result<ExecutionState, Error> {
        self.broadcast_command(execution_id, ExecutionStatus::Paused, |command_id| {
            Command::Pause {
                execution_id: execution_id.to_string(),
                command_id,
            }
        })
        .await
    }

    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionState, Error> {
        self.broadcast_command(execution_id, ExecutionStatus::Running, |command_id| {
            Command::Resume {
                execution_id: execution_id.to_string(),
                command_id,
            }
        })
        .await
    }

    pub async fn abort(&self, execution_id: &str) -> Result<ExecutionState, Error> {
        self.broadcast_command(execution_id, ExecutionStatus::Aborted, |command_id| {
            Command::Abort {
                execution_id: execution_id.to_string(),
                command_id,
            }
        })
        .await
    }

    /// Broadcast a new target VU count to every slave in a running
    /// execution, scaled per slave by its segment width so the ⋃=1
    /// proportionality established at dispatch time is preserved. Does not
    /// change `status` — scaling is orthogonal to the lifecycle DAG.
    pub async fn scale(&self, execution_id: &str, target_vus: u32) -> Result<ExecutionState, Error> {
        let mut executions = self.executions.write().await;
        let state = executions
            .get_mut(execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

        if state.status != ExecutionStatus::Running {
            return Err(Error::Conflict(format!(
                "cannot scale execution {execution_id} while {:?}",
                state.status
            )));
        }

        let targets: Vec<(String, u32)> = state
            .slave_states
            .iter()
            .map(|(id, slave_state)| (id.clone(), Task::scaled_vus(target_vus, slave_state.segment)))
            .collect();

        for (slave_id, slave_target) in targets {
            let command_id = Uuid::new_v4().to_string();
            if let Err(err) = self
                .dispatcher
                .dispatch_command(
                    &slave_id,
                    Command::Scale {
                        execution_id: execution_id.to_string(),
                        command_id,
                        target_vus: slave_target,
                    },
                )
                .await
            {
                state.record_error(ExecutionError::from_error(&err).with_slave(slave_id));
            }
        }

        Ok(state.clone())
    }

    /// Fold a slave's reported per-slave state into the execution, updating
    /// overall progress and flipping to `completed`/`failed` once every
    /// slave has finished. A slave's first transition into `Failed`
    /// triggers a reschedule of its segment onto the surviving slaves so the
    /// segments covering the execution still union to `[0, 1]`.
    pub async fn record_slave_progress(
        &self,
        execution_id: &str,
        slave_id: &str,
        slave_state: SlaveExecutionState,
    ) -> Result<(), Error> {
        use crate::model::execution::SlaveExecutionStatus;

        let mut executions = self.executions.write().await;
        let state = executions
            .get_mut(execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

        let was_already_failed =
            matches!(state.slave_states.get(slave_id).map(|s| s.status), Some(SlaveExecutionStatus::Failed));
        state.slave_states.insert(slave_id.to_string(), slave_state);
        let newly_failed = !was_already_failed
            && matches!(state.slave_states.get(slave_id).map(|s| s.status), Some(SlaveExecutionStatus::Failed));

        if newly_failed {
            self.reschedule_failed_slave(state, slave_id).await;
        }

        state.recompute_progress();

        let all_done = state.slave_states.values().all(|s| {
            matches!(s.status, SlaveExecutionStatus::Completed | SlaveExecutionStatus::Failed)
        });
        if all_done {
            let any_failed = state.slave_states.values().any(|s| s.status == SlaveExecutionStatus::Failed);
            state.transition(if any_failed {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            });
        }
        Ok(())
    }

    /// Repartition `[0, 1]` across every slave still able to make progress
    /// (excludes the slave that just failed) and re-dispatch a fresh `Task`
    /// to each one covering its widened segment. The failed slave's entry is
    /// dropped from `slave_states` once its work has been handed off, so it
    /// no longer counts against the execution's final outcome. If nothing
    /// survives, the failed entry is left in place and the execution
    /// eventually completes as `Failed`.
    async fn reschedule_failed_slave(&self, state: &mut ExecutionState, failed_slave_id: &str) {
        use crate::model::execution::SlaveExecutionStatus;

        state.record_error(
            ExecutionError::new("slave-failed", format!("slave {failed_slave_id} failed mid-execution"))
                .with_slave(failed_slave_id.to_string()),
        );

        let Some(options) = state.task_options.clone() else {
            warn!(failed_slave_id, "cannot reschedule: execution has no recorded task options");
            return;
        };
        if state.workflow.is_null() {
            warn!(failed_slave_id, "cannot reschedule: execution has no recorded workflow payload");
            return;
        }

        let mut survivor_ids: Vec<String> = state
            .slave_states
            .iter()
            .filter(|(id, s)| id.as_str() != failed_slave_id && s.status != SlaveExecutionStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        survivor_ids.sort();

        if survivor_ids.is_empty() {
            warn!(failed_slave_id, "slave failed with no survivors to reschedule onto");
            return;
        }

        let segments = scheduler::partition_segments(survivor_ids.len());
        for (slave_id, segment) in survivor_ids.iter().cloned().zip(segments) {
            let task = Task {
                task_id: Uuid::new_v4().to_string(),
                execution_id: state.id.clone(),
                workflow: state.workflow.clone(),
                segment,
                options: TaskOptions {
                    vus: Task::scaled_vus(options.vus, segment),
                    duration_ms: options.duration_ms,
                    iterations: options.iterations.map(|total| Task::scaled_iterations(total, segment)),
                    mode: options.mode,
                    stages: options.stages.clone(),
                    max_vus: options.max_vus,
                    pre_allocated_vus: options.pre_allocated_vus,
                },
                variables: HashMap::new(),
            };

            if let Some(slave_state) = state.slave_states.get_mut(&slave_id) {
                slave_state.segment = segment;
            }

            if let Err(err) = self.dispatcher.dispatch_task(&slave_id, task).await {
                warn!(slave_id = %slave_id, %err, "failed to redispatch rescheduled task");
                state.record_error(ExecutionError::from_error(&err).with_slave(slave_id));
            }
        }

        state.slave_states.remove(failed_slave_id);
        info!(failed_slave_id, execution_id = %state.id, survivors = survivor_ids.len(), "rescheduled failed slave's segment onto survivors");
    }
}
