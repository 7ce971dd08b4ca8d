//! Approval gate manager.
//!
//! A gate stage parks its build on a decision channel; responders resolve it
//! through `respond`. Gates time out at their deadline and fail the build.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::info;

use chengis_core::approval::{ApprovalDecision, ApprovalGate, ApprovalStatus};
use chengis_core::pipeline::ApprovalSpec;
use chengis_core::{Error, ResourceId, Result};
use chengis_db::ApprovalRepo;
use tokio_util::sync::CancellationToken;

/// What a waiting stage observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    Decision(ApprovalDecision),
    Cancelled,
}

pub struct ApprovalManager {
    store: Arc<dyn ApprovalRepo>,
    waiters: Mutex<HashMap<(ResourceId, String), oneshot::Sender<ApprovalDecision>>>,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn ApprovalRepo>) -> Self {
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Open a gate and wait until it resolves, times out, or the build is
    /// cancelled.
    pub async fn wait(
        &self,
        build_id: ResourceId,
        stage: &str,
        spec: &ApprovalSpec,
        cancel: &CancellationToken,
    ) -> Result<GateWait> {
        let deadline = Utc::now() + ChronoDuration::seconds(spec.timeout_secs as i64);
        let gate = ApprovalGate {
            build_id,
            stage: stage.to_string(),
            required_role: spec.required_role.clone(),
            min_approvals: spec.min_approvals,
            responses: HashMap::new(),
            deadline,
            status: ApprovalStatus::Pending,
        };
        self.store.create(&gate).await.map_err(Error::from)?;

        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .await
            .insert((build_id, stage.to_string()), tx);

        // A response may have landed between create and waiter registration.
        if let Some(gate) = self.store.get(build_id, stage).await.map_err(Error::from)? {
            let resolved = match gate.status {
                ApprovalStatus::Approved => Some(ApprovalDecision::Approved),
                ApprovalStatus::Rejected => Some(ApprovalDecision::Rejected),
                ApprovalStatus::TimedOut => Some(ApprovalDecision::TimedOut),
                ApprovalStatus::Pending => None,
            };
            if let Some(decision) = resolved {
                self.waiters
                    .lock()
                    .await
                    .remove(&(build_id, stage.to_string()));
                return Ok(GateWait::Decision(decision));
            }
        }

        let timeout = std::time::Duration::from_secs(spec.timeout_secs);
        let outcome = tokio::select! {
            decision = rx => match decision {
                Ok(decision) => GateWait::Decision(decision),
                // Sender dropped without a decision; treat as rejection.
                Err(_) => GateWait::Decision(ApprovalDecision::Rejected),
            },
            _ = tokio::time::sleep(timeout) => {
                self.resolve_record(build_id, stage, ApprovalStatus::TimedOut).await?;
                GateWait::Decision(ApprovalDecision::TimedOut)
            }
            _ = cancel.cancelled() => GateWait::Cancelled,
        };
        self.waiters
            .lock()
            .await
            .remove(&(build_id, stage.to_string()));
        Ok(outcome)
    }

    /// Record one responder's decision. A rejection resolves immediately;
    /// approvals resolve once `min_approvals` is reached.
    pub async fn respond(
        &self,
        build_id: ResourceId,
        stage: &str,
        responder: &str,
        approve: bool,
    ) -> Result<ApprovalStatus> {
        let mut gate = self
            .store
            .get(build_id, stage)
            .await
            .map_err(Error::from)?
            .ok_or_else(|| Error::NotFound(format!("approval gate {build_id}/{stage}")))?;
        if gate.status != ApprovalStatus::Pending {
            return Ok(gate.status);
        }

        gate.responses.insert(responder.to_string(), approve);
        let approvals = gate.responses.values().filter(|v| **v).count() as u32;

        let resolved = if !approve {
            Some((ApprovalStatus::Rejected, ApprovalDecision::Rejected))
        } else if approvals >= gate.min_approvals {
            Some((ApprovalStatus::Approved, ApprovalDecision::Approved))
        } else {
            None
        };

        if let Some((status, decision)) = resolved {
            gate.status = status;
            self.store.update(&gate).await.map_err(Error::from)?;
            if let Some(tx) = self
                .waiters
                .lock()
                .await
                .remove(&(build_id, stage.to_string()))
            {
                let _ = tx.send(decision);
            }
            info!(build_id = %build_id, stage = %stage, status = ?status, "approval gate resolved");
            Ok(status)
        } else {
            self.store.update(&gate).await.map_err(Error::from)?;
            Ok(ApprovalStatus::Pending)
        }
    }

    async fn resolve_record(
        &self,
        build_id: ResourceId,
        stage: &str,
        status: ApprovalStatus,
    ) -> Result<()> {
        if let Some(mut gate) = self.store.get(build_id, stage).await.map_err(Error::from)? {
            gate.status = status;
            self.store.update(&gate).await.map_err(Error::from)?;
        }
        Ok(())
    }
}
