use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Segment, TaskOptions};

// ---------------------------------------------------------------------------
// ExecutionStatus — the execution-wide lifecycle state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    /// Legal transition DAG: `pending -> running -> {paused <-> running} ->
    /// {completed | failed | aborted}`. Terminal states accept no further
    /// transitions. `aborted` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        if self.is_terminal() {
            return false;
        }
        if next == Aborted {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

// ---------------------------------------------------------------------------
// ExecutionError — the exact error-ledger entry shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionError {
    pub code: String,
    pub message: String,
    pub step_id: Option<String>,
    pub slave_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            step_id: None,
            slave_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_slave(mut self, slave_id: impl Into<String>) -> Self {
        self.slave_id = Some(slave_id.into());
        self
    }

    pub fn from_error(err: &crate::Error) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// SlaveExecutionState — per-slave progress within a single execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveExecutionStatus {
    Assigned,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveExecutionMetrics {
    pub requests: u64,
    pub failures: u64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SlaveExecutionState {
    pub status: SlaveExecutionStatus,
    pub segment: Segment,
    pub completed_vus: u32,
    pub completed_iterations: u64,
    #[serde(default)]
    pub metrics: SlaveExecutionMetrics,
}

impl SlaveExecutionState {
    pub fn new(segment: Segment) -> Self {
        Self {
            status: SlaveExecutionStatus::Assigned,
            segment,
            completed_vus: 0,
            completed_iterations: 0,
            metrics: SlaveExecutionMetrics::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionState — the top-level aggregate tracked by the coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionState {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Overall completion fraction in `[0, 1]`, derived from slave states.
    pub progress: f64,
    #[serde(default)]
    pub slave_states: HashMap<String, SlaveExecutionState>,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    /// The workflow payload and per-execution task options, kept around so a
    /// slave failure mid-run can rebuild a `Task` for the survivors that
    /// inherit its segment. `Value::Null`/`None` for executions constructed
    /// without them (tests, mostly).
    #[serde(default)]
    pub workflow: serde_json::Value,
    #[serde(default)]
    pub task_options: Option<TaskOptions>,
}

impl ExecutionState {
    pub fn new(id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            start: None,
            end: None,
            progress: 0.0,
            slave_states: HashMap::new(),
            errors: Vec::new(),
            workflow: serde_json::Value::Null,
            task_options: None,
        }
    }

    /// Attempt a status transition, returning whether it was legal. Illegal
    /// transitions leave `status` unchanged.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            ExecutionStatus::Running if self.start.is_none() => self.start = Some(Utc::now()),
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted => {
                self.end = Some(Utc::now())
            }
            _ => {}
        }
        self.status = next;
        true
    }

    pub fn record_error(&mut self, error: ExecutionError) {
        self.errors.push(error);
    }

    /// Recompute `progress` as the unweighted mean of per-slave completion
    /// fractions, each derived from that slave's own segment width share of
    /// its assigned iteration target. Slaves with no target contribute 1.0
    /// once completed, 0.0 otherwise.
    pub fn recompute_progress(&mut self) {
        if self.slave_states.is_empty() {
            self.progress = 0.0;
            return;
        }
        let sum: f64 = self
            .slave_states
            .values()
            .map(|s| match s.status {
                SlaveExecutionStatus::Completed => 1.0,
                SlaveExecutionStatus::Failed => 1.0,
                SlaveExecutionStatus::Assigned => 0.0,
                SlaveExecutionStatus::Running => 0.5,
            })
            .sum();
        self.progress = sum / self.slave_states.len() as f64;
    }
}
