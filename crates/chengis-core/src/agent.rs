//! Agent (worker node) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ResourceId;

/// A worker node registered with the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: ResourceId,
    pub name: String,
    /// Base URL the master dispatches builds to.
    pub url: String,
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    pub current_builds: u32,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub system: SystemInfo,
    pub region: Option<String>,
    /// None means the agent is shared across orgs.
    pub org_id: Option<ResourceId>,
}

impl Agent {
    pub fn has_capacity(&self) -> bool {
        self.current_builds < self.max_builds
    }

    pub fn has_labels(&self, required: &BTreeSet<String>) -> bool {
        required.iter().all(|l| self.labels.contains(l))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Draining,
}

/// Host capacity reported by the agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu_count: u32,
    pub memory_mb: u64,
}

/// Registration request from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub max_builds: u32,
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub org_id: Option<ResourceId>,
}

/// Periodic heartbeat body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatUpdate {
    #[serde(default)]
    pub current_builds: Option<u32>,
    #[serde(default)]
    pub system: Option<SystemInfo>,
}

/// Hints used by resource-aware scheduling.
#[derive(Debug, Clone, Default)]
pub struct ResourceHints {
    pub min_cpu: Option<u32>,
    pub min_memory_mb: Option<u64>,
    pub region: Option<String>,
}
