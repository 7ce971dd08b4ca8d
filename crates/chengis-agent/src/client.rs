//! HTTP client for agent → master calls.

use reqwest::StatusCode;
use std::time::Duration;

use chengis_core::ResourceId;
use chengis_core::agent::{AgentRegistration, HeartbeatUpdate};
use chengis_core::build::BuildStatus;
use chengis_core::event::NewBuildEvent;
use chengis_core::{Error, Result};
use chengis_engine::client::AUTH_HEADER;

#[derive(Clone)]
pub struct MasterClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl MasterClient {
    pub fn new(master_url: String, auth_token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: master_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTH_HEADER, token);
        }
        builder
    }

    pub async fn register(&self, registration: &AgentRegistration) -> Result<ResourceId> {
        let response = self
            .request(reqwest::Method::POST, "/api/agents/register")
            .json(registration)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("register failed: {e}")))?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::Dispatch(format!(
                "register rejected: {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Dispatch(format!("register body: {e}")))?;
        body.get("agent_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::Dispatch("register response missing agent_id".to_string()))
    }

    pub async fn heartbeat(&self, agent_id: ResourceId, update: &HeartbeatUpdate) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/agents/{agent_id}/heartbeat"),
            )
            .json(update)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("heartbeat failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Dispatch(format!(
                "heartbeat rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn deregister(&self, agent_id: ResourceId) -> Result<()> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/agents/{agent_id}/deregister"),
        )
        .send()
        .await
        .map_err(|e| Error::Dispatch(format!("deregister failed: {e}")))?;
        Ok(())
    }

    /// Forward a batch of build events upstream.
    pub async fn forward_events(
        &self,
        build_id: ResourceId,
        events: &[NewBuildEvent],
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/builds/{build_id}/events/forward"),
            )
            .json(events)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("event forward failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Dispatch(format!(
                "event forward rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }

    pub async fn complete_build(
        &self,
        build_id: ResourceId,
        status: BuildStatus,
        failure_reason: Option<&str>,
        failed_stage: Option<&str>,
        dispatch_token: uuid::Uuid,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/builds/{build_id}/complete"),
            )
            .json(&serde_json::json!({
                "status": status,
                "failure_reason": failure_reason,
                "failed_stage": failed_stage,
                "dispatch_token": dispatch_token,
            }))
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("completion callback failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Dispatch(format!(
                "completion rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Upload one artifact's content.
    pub async fn upload_artifact(
        &self,
        build_id: ResourceId,
        path: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/builds/{build_id}/artifact"),
            )
            .query(&[("path", path)])
            .body(content)
            .send()
            .await
            .map_err(|e| Error::Dispatch(format!("artifact upload failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Dispatch(format!(
                "artifact upload rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
