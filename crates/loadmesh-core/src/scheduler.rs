use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{Segment, SlaveInfo, Status};

// ---------------------------------------------------------------------------
// SelectionMode — how the scheduler picks which slaves run a workflow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Caller names exact slave ids.
    Manual,
    /// Slaves matching a set of `labels`.
    Label,
    /// Slaves whose `capabilities` are a superset of the workflow's required
    /// capabilities.
    Capability,
    /// Scheduler picks every eligible online, non-draining slave.
    Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SelectionCriteria {
    pub mode: SelectionMode,
    #[serde(default)]
    pub slave_ids: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: HashSet<String>,
    /// For `Auto` mode only: the run fails rather than under-provisioning
    /// if fewer than this many slaves are eligible.
    #[serde(default)]
    pub min_slaves: Option<u32>,
    /// For `Auto` mode only: caps how many of the eligible slaves (sorted
    /// by id) actually get a segment, even if more are available.
    #[serde(default)]
    pub max_slaves: Option<u32>,
}

impl Default for SelectionMode {
    fn default() -> Self {
        SelectionMode::Auto
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("no slaves matched the selection criteria")]
    NoEligibleSlaves,
    #[error("only {available} slave(s) eligible, need at least {required}")]
    InsufficientSlaves { available: usize, required: u32 },
}

/// Select the slaves a workflow should run on, in a deterministic order
/// (registry insertion order is not guaranteed, so callers must sort by
/// `id` beforehand for a stable assignment — `select` does this itself).
/// In `Auto` mode, `criteria.max_slaves` truncates the sorted list so a
/// run never claims more slaves than the caller wants to pay for.
pub fn select_slaves(slaves: &[SlaveInfo], statuses: &HashMap<String, Status>, criteria: &SelectionCriteria) -> Vec<SlaveInfo> {
    let mut eligible: Vec<SlaveInfo> = slaves
        .iter()
        .filter(|s| matches_mode(s, criteria))
        .filter(|s| {
            matches!(
                statuses.get(&s.id),
                Some(Status::Online)
            )
        })
        .cloned()
        .collect();
    eligible.sort_by(|a, b| a.id.cmp(&b.id));
    if criteria.mode == SelectionMode::Auto {
        if let Some(max) = criteria.max_slaves {
            eligible.truncate(max as usize);
        }
    }
    eligible
}

fn matches_mode(slave: &SlaveInfo, criteria: &SelectionCriteria) -> bool {
    match criteria.mode {
        SelectionMode::Manual => criteria.slave_ids.iter().any(|id| id == &slave.id),
        SelectionMode::Label => slave.has_labels(&criteria.labels),
        SelectionMode::Capability => slave.has_capabilities(&criteria.capabilities),
        SelectionMode::Auto => true,
    }
}

/// Partition `[0, 1]` into `n` equal-width, non-overlapping segments whose
/// union is exactly `[0, 1]`. `n == 0` yields an empty vector.
pub fn partition_segments(n: usize) -> Vec<Segment> {
    if n == 0 {
        return Vec::new();
    }
    let width = 1.0 / n as f64;
    (0..n)
        .map(|i| {
            let start = i as f64 * width;
            let end = if i == n - 1 { 1.0 } else { (i + 1) as f64 * width };
            Segment::new(start, end)
        })
        .collect()
}

/// Select eligible slaves and assign each a segment, in one step. Returns
/// `SchedulingError::NoEligibleSlaves` if the criteria match nothing, or
/// `SchedulingError::InsufficientSlaves` if `Auto` mode's `min_slaves`
/// floor isn't met after selection.
pub fn schedule(
    slaves: &[SlaveInfo],
    statuses: &HashMap<String, Status>,
    criteria: &SelectionCriteria,
) -> Result<Vec<(SlaveInfo, Segment)>, SchedulingError> {
    let eligible = select_slaves(slaves, statuses, criteria);
    if eligible.is_empty() {
        return Err(SchedulingError::NoEligibleSlaves);
    }
    if criteria.mode == SelectionMode::Auto {
        if let Some(min) = criteria.min_slaves {
            if eligible.len() < min as usize {
                return Err(SchedulingError::InsufficientSlaves {
                    available: eligible.len(),
                    required: min,
                });
            }
        }
    }
    let segments = partition_segments(eligible.len());
    Ok(eligible.into_iter().zip(segments).collect())
}
