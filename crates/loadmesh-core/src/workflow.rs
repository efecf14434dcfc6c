use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::model::{ExecutionMode, Stage};

/// A single HTTP (or other protocol) step inside a workflow. Kept as a raw
/// JSON object at the engine boundary (see `client::HttpTaskHandler`) but
/// validated here against the minimal shape every step must carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowStep {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// The default execution profile a workflow runs under unless a caller
/// overrides it when starting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WorkflowDefaults {
    pub vus: u32,
    pub duration_ms: Option<u64>,
    pub iterations: Option<u64>,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub max_vus: Option<u32>,
    #[serde(default)]
    pub pre_allocated_vus: Option<u32>,
}

/// A named, versioned workflow definition: the thing a user authors and the
/// coordinator schedules executions of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub defaults: WorkflowDefaults,
}

fn default_format_version() -> u32 {
    1
}

impl Workflow {
    pub fn validate(&self) -> Result<(), Error> {
        if self.steps.is_empty() {
            return Err(Error::Validation("workflow must have at least one step".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(Error::Validation("workflow step id must not be empty".to_string()));
            }
            if !seen.insert(step.id.clone()) {
                return Err(Error::Validation(format!("duplicate step id: {}", step.id)));
            }
            if step.url.is_empty() {
                return Err(Error::Validation(format!("step {} missing url", step.id)));
            }
        }
        match self.defaults.mode {
            ExecutionMode::RampingVus | ExecutionMode::RampingArrivalRate => {
                if self.defaults.stages.is_empty() {
                    return Err(Error::Validation(
                        "ramping modes require at least one stage".to_string(),
                    ));
                }
            }
            ExecutionMode::ConstantVus | ExecutionMode::ConstantArrivalRate => {
                if self.defaults.duration_ms.is_none() {
                    return Err(Error::Validation(
                        "constant modes require duration_ms".to_string(),
                    ));
                }
            }
            ExecutionMode::PerVuIterations | ExecutionMode::SharedIterations => {
                if self.defaults.iterations.is_none() {
                    return Err(Error::Validation(
                        "iteration-based modes require iterations".to_string(),
                    ));
                }
            }
        }
        if let (Some(pre_allocated), Some(max)) = (self.defaults.pre_allocated_vus, self.defaults.max_vus) {
            if pre_allocated > max {
                return Err(Error::Validation(
                    "pre_allocated_vus must not exceed max_vus".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Serialize to the canonical JSON form used on the wire and for
    /// storage, the inverse of [`Workflow::from_json`].
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workflow {
        Workflow {
            id: "wf1".to_string(),
            name: "smoke test".to_string(),
            format_version: 1,
            steps: vec![WorkflowStep {
                id: "step1".to_string(),
                method: "GET".to_string(),
                url: "https://example.com".to_string(),
                headers: HashMap::new(),
                body: None,
            }],
            variables: HashMap::new(),
            defaults: WorkflowDefaults {
                vus: 10,
                duration_ms: Some(30_000),
                iterations: None,
                mode: ExecutionMode::ConstantVus,
                stages: vec![],
                max_vus: None,
                pre_allocated_vus: None,
            },
        }
    }

    #[test]
    fn validate_accepts_well_formed_workflow() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_steps() {
        let mut wf = sample();
        wf.steps.clear();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_step_ids() {
        let mut wf = sample();
        wf.steps.push(wf.steps[0].clone());
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_requires_duration_for_constant_modes() {
        let mut wf = sample();
        wf.defaults.duration_ms = None;
        assert!(wf.validate().is_err());
    }

    #[test]
    fn validate_requires_stages_for_ramping_modes() {
        let mut wf = sample();
        wf.defaults.mode = ExecutionMode::RampingVus;
        wf.defaults.duration_ms = None;
        assert!(wf.validate().is_err());
        wf.defaults.stages.push(Stage { duration_ms: 10_000, target: 5 });
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn validate_rejects_pre_allocated_vus_above_max_vus() {
        let mut wf = sample();
        wf.defaults.pre_allocated_vus = Some(20);
        wf.defaults.max_vus = Some(10);
        assert!(wf.validate().is_err());
    }

    #[test]
    fn json_round_trip_is_lossless() {
        let wf = sample();
        let json = wf.to_json().unwrap();
        let parsed = Workflow::from_json(&json).unwrap();
        assert_eq!(parsed.id, wf.id);
        assert_eq!(parsed.steps.len(), wf.steps.len());
    }

    #[test]
    fn yaml_round_trip_is_lossless() {
        let wf = sample();
        let yaml = wf.to_yaml().unwrap();
        let parsed = Workflow::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.name, wf.name);
        assert_eq!(parsed.defaults.vus, wf.defaults.vus);
    }

    #[test]
    fn format_version_defaults_to_one_when_absent() {
        let json = r#"{"id":"wf2","name":"n","steps":[{"id":"s","method":"GET","url":"http://x"}],"defaults":{"vus":1,"mode":"constant_vus","duration_ms":10000}}"#;
        let parsed = Workflow::from_json(json).unwrap();
        assert_eq!(parsed.format_version, 1);
    }
}
