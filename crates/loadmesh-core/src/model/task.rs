use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExecutionMode — the load-shape profile a task is driven by
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    ConstantVus,
    RampingVus,
    ConstantArrivalRate,
    RampingArrivalRate,
    PerVuIterations,
    SharedIterations,
}

// ---------------------------------------------------------------------------
// Segment — the fraction of the workflow's total VUs/iterations a slave owns
// ---------------------------------------------------------------------------

/// A half-open-by-convention fraction of the overall workload, expressed as
/// `[start, end] ⊆ [0, 1]`. The scheduler partitions `[0, 1]` into
/// equal-width, non-overlapping segments whose union covers `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Segment {
    pub start: f64,
    pub end: f64,
}

impl Segment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn full() -> Self {
        Self { start: 0.0, end: 1.0 }
    }

    pub fn width(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.start)
            && (0.0..=1.0).contains(&self.end)
            && self.start <= self.end
    }
}

// ---------------------------------------------------------------------------
// Stage — one step of a ramping profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Stage {
    pub duration_ms: u64,
    pub target: u32,
}

// ---------------------------------------------------------------------------
// TaskOptions — per-slave execution parameters, scaled from workflow totals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskOptions {
    pub vus: u32,
    pub duration_ms: Option<u64>,
    pub iterations: Option<u64>,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Hard ceiling on concurrently active VUs. `ramping_vus` never ramps
    /// past it; the arrival-rate engines drop a tick rather than spawn an
    /// iteration beyond it. `None` leaves the engine's own natural ceiling
    /// (the highest stage target, or unbounded for arrival rate) in place.
    #[serde(default)]
    pub max_vus: Option<u32>,
    /// For the arrival-rate engines, the number of VUs guaranteed to be
    /// available without hitting `max_vus`. Must not exceed `max_vus` when
    /// both are set; validated at workflow-definition time.
    #[serde(default)]
    pub pre_allocated_vus: Option<u32>,
}

// ---------------------------------------------------------------------------
// Task — the unit of work handed to a single slave for one execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    pub task_id: String,
    pub execution_id: String,
    pub workflow: serde_json::Value,
    pub segment: Segment,
    pub options: TaskOptions,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Proportional share of `total_vus` owned by this task's segment,
    /// ceiling-rounded and never zero for a non-empty segment. A segment of
    /// width zero (a slave asked to do nothing) legitimately yields zero.
    pub fn scaled_vus(total_vus: u32, segment: Segment) -> u32 {
        scaled_count(total_vus as f64, segment)
    }

    /// Same rounding rule as `scaled_vus`, applied to a total iteration
    /// count.
    pub fn scaled_iterations(total_iterations: u64, segment: Segment) -> u64 {
        scaled_count(total_iterations as f64, segment) as u64
    }
}

fn scaled_count(total: f64, segment: Segment) -> u32 {
    let width = segment.width();
    if width <= 0.0 {
        return 0;
    }
    let raw = total * width;
    let scaled = raw.ceil() as u32;
    scaled.max(1)
}
