//! Metrics-query monitor controller (Prometheus HTTP API).
//!
//! A monitoring's config carries `query` and an optional `timeout` such as
//! `5s`. A check passes when the backend answers 200 with
//! `status == "success"` and at least one sample.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancellable, parse_duration, required, ControllerError, MonitorController, Result};
use crate::model::Metadata;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `GET /query`.
#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    #[serde(default)]
    pub data: QueryData,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryData {
    #[serde(default, rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
pub struct QuerySample {
    #[serde(default)]
    pub metric: HashMap<String, String>,
    /// `[unix_timestamp, "value"]`
    #[serde(default)]
    pub value: Option<(f64, String)>,
}

pub struct PromQlController {
    client: Client,
    api_url: String,
    default_timeout: Duration,
}

impl PromQlController {
    /// `api_url` is the API root, e.g. `http://prometheus:9090/api/v1`.
    pub fn new(api_url: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            default_timeout,
        }
    }

    fn timeout_for(&self, metadata: &Metadata) -> Duration {
        match metadata.get("timeout").filter(|t| !t.trim().is_empty()) {
            None => self.default_timeout,
            Some(raw) => parse_duration(raw).unwrap_or_else(|e| {
                warn!(error = %e, "unparseable query timeout, using default");
                self.default_timeout
            }),
        }
    }

    async fn query(&self, query: &str, timeout: Duration) -> Result<usize> {
        let url = format!("{}/query", self.api_url);
        debug!(%url, %query, "running metrics query");

        let resp = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ControllerError::Timeout(timeout)
                } else {
                    ControllerError::Transport(format!("failed to query metrics backend: {e}"))
                }
            })?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ControllerError::Transport(format!("failed to read metrics response: {e}")))?;
        evaluate_response(status, &body)
    }
}

/// Judge a backend answer; returns the number of samples on success.
pub fn evaluate_response(status: StatusCode, body: &str) -> Result<usize> {
    if status != StatusCode::OK {
        return Err(ControllerError::Execution(format!(
            "metrics API returned status {}: {}",
            status.as_u16(),
            body.trim()
        )));
    }

    let parsed: QueryResponse = serde_json::from_str(body)
        .map_err(|e| ControllerError::Decode(format!("failed to decode metrics response: {e}")))?;

    if parsed.status != "success" {
        return Err(ControllerError::Execution(format!(
            "metrics query failed with status: {}",
            parsed.status
        )));
    }
    if parsed.data.result.is_empty() {
        return Err(ControllerError::Execution("metrics query returned no data".to_string()));
    }
    Ok(parsed.data.result.len())
}

#[async_trait]
impl MonitorController for PromQlController {
    fn validate_check(&self, monitor_metadata: &Metadata) -> Result<()> {
        required(monitor_metadata, "query", "monitoring").map(|_| ())
    }

    fn validate_monitoring(&self, config: &Metadata) -> Result<()> {
        required(config, "query", "monitoring")?;
        if let Some(raw) = config.get("timeout").filter(|t| !t.trim().is_empty()) {
            parse_duration(raw)?;
        }
        Ok(())
    }

    async fn run_check(&self, monitor_metadata: &Metadata, cancel: &CancellationToken) -> Result<()> {
        let query = required(monitor_metadata, "query", "monitoring")?;
        let timeout = self.timeout_for(monitor_metadata);
        let samples = cancellable(cancel, self.query(query, timeout)).await?;
        info!(%query, samples, "metrics check passed");
        Ok(())
    }
}
