//! HTTP client for master → agent calls.

use reqwest::StatusCode;
use std::time::Duration;

use chengis_core::queue::DispatchPayload;
use chengis_core::{Error, Result};

/// Header carrying the shared secret on both directions.
pub const AUTH_HEADER: &str = "x-chengis-token";

/// Thin reqwest wrapper for dispatching builds to agents.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    auth_token: Option<String>,
}

impl AgentClient {
    pub fn new(auth_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http, auth_token }
    }

    /// POST the build payload to the agent's build endpoint. 202 means the
    /// agent accepted the build into its local queue.
    pub async fn dispatch_build(&self, agent_url: &str, payload: &DispatchPayload) -> Result<()> {
        let url = format!("{}/builds", agent_url.trim_end_matches('/'));
        let mut request = self.http.post(&url).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.header(AUTH_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("agent {agent_url} unreachable: {e}")))?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::OK => Ok(()),
            status => Err(Error::Dispatch(format!(
                "agent {agent_url} rejected build: {status}"
            ))),
        }
    }

    /// GET the agent's health endpoint.
    pub async fn check_health(&self, agent_url: &str) -> bool {
        let url = format!("{}/health", agent_url.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
