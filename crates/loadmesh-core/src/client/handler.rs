use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::Error;

/// Outcome of running a single workflow step against a target.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub duration_ms: f64,
    pub success: bool,
    pub status_code: Option<u16>,
}

/// The seam between the VU loop and whatever actually exercises the target.
/// The shared VU driver in `engine::vu` is generic over this trait so the
/// same ramp-up/ramp-down/iteration bookkeeping serves every load shape
/// regardless of what a "step" means for a given workflow.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute_step(
        &self,
        step: &Value,
        variables: &HashMap<String, Value>,
    ) -> Result<StepOutcome, Error>;
}

/// Default handler: a workflow step is a JSON object shaped like
/// `{"id", "method", "url", "headers"?, "body"?}`, executed as a single HTTP
/// request. `${var}` placeholders in `url`/`headers`/`body` are substituted
/// from `variables` before the request is built.
pub struct HttpTaskHandler {
    client: Client,
}

impl HttpTaskHandler {
    pub fn new() -> Result<Self, Error> {
        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

impl Default for HttpTaskHandler {
    fn default() -> Self {
        Self::new().expect("default reqwest client should build")
    }
}

/// Replace every `${name}` occurrence in `text` with the string form of
/// `variables[name]`, leaving unknown placeholders untouched.
pub fn substitute_variables(text: &str, variables: &HashMap<String, Value>) -> String {
    let mut result = text.to_string();
    for (name, value) in variables {
        let placeholder = format!("${{{name}}}");
        if result.contains(&placeholder) {
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            result = result.replace(&placeholder, &replacement);
        }
    }
    result
}

#[async_trait]
impl TaskHandler for HttpTaskHandler {
    async fn execute_step(
        &self,
        step: &Value,
        variables: &HashMap<String, Value>,
    ) -> Result<StepOutcome, Error> {
        let step_id = step
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed")
            .to_string();
        let method = step
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .map_err(|e| Error::Validation(format!("invalid method: {e}")))?;
        let raw_url = step
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation("step missing url".to_string()))?;
        let url = substitute_variables(raw_url, variables);

        let mut builder = self.client.request(method, &url);
        if let Some(headers) = step.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value_str) = value.as_str() {
                    builder = builder.header(key, substitute_variables(value_str, variables));
                }
            }
        }
        if let Some(body) = step.get("body") {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let response = builder.send().await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match response {
            Ok(resp) => {
                let status = resp.status();
                Ok(StepOutcome {
                    step_id,
                    duration_ms,
                    success: status.is_success(),
                    status_code: Some(status.as_u16()),
                })
            }
            Err(err) => Ok(StepOutcome {
                step_id,
                duration_ms,
                success: false,
                status_code: err.status().map(|s| s.as_u16()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_known_placeholder() {
        let mut vars = HashMap::new();
        vars.insert("host".to_string(), Value::String("example.com".to_string()));
        let result = substitute_variables("https://${host}/api", &vars);
        assert_eq!(result, "https://example.com/api");
    }

    #[test]
    fn substitute_leaves_unknown_placeholder_untouched() {
        let vars = HashMap::new();
        let result = substitute_variables("https://${host}/api", &vars);
        assert_eq!(result, "https://${host}/api");
    }

    #[test]
    fn substitute_handles_numeric_values() {
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), Value::from(42));
        let result = substitute_variables("n=${count}", &vars);
        assert_eq!(result, "n=42");
    }
}
