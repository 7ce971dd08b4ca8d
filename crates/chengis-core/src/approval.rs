//! Approval gate model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ResourceId;

/// A pending or resolved approval gate blocking a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub build_id: ResourceId,
    pub stage: String,
    pub required_role: String,
    pub min_approvals: u32,
    /// Responder name to decision.
    pub responses: HashMap<String, bool>,
    pub deadline: DateTime<Utc>,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

/// Final resolution delivered to a waiting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
}
