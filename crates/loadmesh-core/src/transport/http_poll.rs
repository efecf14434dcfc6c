use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use crate::error::Error;
use crate::transport::envelope::Envelope;

/// Fallback transport for slaves that cannot hold a persistent socket open
/// (behind a strict egress proxy, for instance). Each `poll` is a single
/// HTTP round trip that both ships buffered results and asks for any
/// pending commands, mirroring the long-poll shape of `Envelope` exchange
/// the socket transport does continuously.
pub struct HttpPollTransport {
    client: Client,
    base_url: String,
    slave_id: String,
}

impl HttpPollTransport {
    pub fn new(base_url: impl Into<String>, slave_id: impl Into<String>) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            slave_id: slave_id.into(),
        })
    }

    pub async fn send(&self, envelope: Envelope) -> Result<Envelope, Error> {
        let url = format!("{}/api/v1/slaves/{}/poll", self.base_url, self.slave_id);
        let response = self.client.post(&url).json(&envelope).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "poll request rejected by master");
            return Err(Error::Connection(format!("poll request failed: {status}")));
        }
        let reply: Envelope = response.json().await?;
        Ok(reply)
    }

    pub async fn register(&self, info: crate::model::SlaveInfo) -> Result<String, Error> {
        let url = format!("{}/api/v1/slaves", self.base_url);
        let response = self.client.post(&url).json(&info).send().await?;
        if !response.status().is_success() {
            return Err(Error::Connection(format!(
                "registration failed: {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await?;
        body.get("slave_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Parsing("registration response missing slave_id".to_string()))
    }
}
