//! Monitoring Agent
//!
//! Collects a [`HostMetrics`] snapshot and posts it to the Deployer
//! monitoring endpoint as a url-encoded form. The response is logged, not
//! interpreted.

pub mod metrics;

pub use metrics::HostMetrics;

use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::agents::keys::fetcher::{user_agent, REQUEST_TIMEOUT};
use crate::agents::keys::AgentError;
use crate::config::MonitorTarget;

/// Monitoring Agent
pub struct MonitorAgent {
    client: Client,
    target: MonitorTarget,
}

impl MonitorAgent {
    pub fn new(target: MonitorTarget) -> Result<Self, AgentError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, target })
    }

    /// `{base}monitoring`
    pub fn endpoint(&self) -> String {
        format!("{}monitoring", self.target.base_domain)
    }

    /// Collect and send one snapshot
    pub async fn report(&self) -> Result<StatusCode, AgentError> {
        let metrics = HostMetrics::collect();
        debug!(?metrics, "Collected host metrics");
        self.send(&metrics).await
    }

    /// Post `metrics` to the monitoring endpoint
    pub async fn send(&self, metrics: &HostMetrics) -> Result<StatusCode, AgentError> {
        let url = self.endpoint();
        info!(url = %url, "📊 Sending server metrics");

        let response = self
            .client
            .post(&url)
            .header("TeamApiKey", &self.target.team_api_key)
            .header("ServerApiKey", &self.target.server_id)
            .form(&metrics.form_fields())
            .send()
            .await
            .map_err(|e| AgentError::Network(format!("Failed to send metrics: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            info!(status = %status, "Metrics delivered");
        } else {
            warn!(status = %status, "Monitoring endpoint did not accept the metrics");
        }
        Ok(status)
    }
}
