//! In-memory agent registry with optional write-through persistence.
//!
//! All state changes serialize under one lock; selection snapshots a view.
//! With the resource-aware flag off, scoring is plain least-loaded; with it
//! on, the score folds in load ratio, region locality, and headroom.

use chrono::{Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use chengis_core::agent::{Agent, AgentRegistration, AgentStatus, HeartbeatUpdate, ResourceHints};
use chengis_core::{Error, ResourceId, Result};
use chengis_db::AgentRepo;

/// Aggregate view for operators and metrics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub draining: usize,
    pub total_capacity: u32,
    pub builds_in_flight: u32,
}

pub struct AgentRegistry {
    agents: Mutex<HashMap<ResourceId, Agent>>,
    store: Option<Arc<dyn AgentRepo>>,
    resource_aware: bool,
}

impl AgentRegistry {
    pub fn new(store: Option<Arc<dyn AgentRepo>>, resource_aware: bool) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            store,
            resource_aware,
        }
    }

    /// Load persisted agents on master boot.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all().await.map_err(Error::from)?;
        let count = loaded.len();
        let mut agents = self.agents.lock().await;
        for agent in loaded {
            agents.insert(agent.id, agent);
        }
        Ok(count)
    }

    /// Upsert by name: re-registration of a known agent keeps its id.
    pub async fn register(&self, registration: AgentRegistration) -> Result<Agent> {
        let mut agents = self.agents.lock().await;
        let existing_id = agents
            .values()
            .find(|a| a.name == registration.name)
            .map(|a| a.id);

        let agent = match existing_id {
            Some(id) => {
                let agent = agents.get_mut(&id).ok_or_else(|| {
                    Error::Internal("registry entry vanished during register".to_string())
                })?;
                agent.url = registration.url;
                agent.labels = registration.labels;
                agent.max_builds = registration.max_builds;
                agent.system = registration.system;
                agent.region = registration.region;
                agent.status = AgentStatus::Online;
                agent.last_heartbeat = Utc::now();
                agent.clone()
            }
            None => {
                let agent = Agent {
                    id: ResourceId::new(),
                    name: registration.name,
                    url: registration.url,
                    labels: registration.labels,
                    max_builds: registration.max_builds,
                    current_builds: 0,
                    status: AgentStatus::Online,
                    last_heartbeat: Utc::now(),
                    system: registration.system,
                    region: registration.region,
                    org_id: registration.org_id,
                };
                agents.insert(agent.id, agent.clone());
                agent
            }
        };
        drop(agents);

        info!(agent = %agent.name, id = %agent.id, "agent registered");
        self.persist(&agent).await;
        Ok(agent)
    }

    /// Refresh heartbeat and counters; false when the agent is unknown.
    pub async fn heartbeat(&self, id: ResourceId, update: HeartbeatUpdate) -> bool {
        let mut agents = self.agents.lock().await;
        let Some(agent) = agents.get_mut(&id) else {
            return false;
        };
        agent.last_heartbeat = Utc::now();
        if agent.status == AgentStatus::Offline {
            agent.status = AgentStatus::Online;
        }
        if let Some(current) = update.current_builds {
            agent.current_builds = current.min(agent.max_builds);
        }
        if let Some(system) = update.system {
            agent.system = system;
        }
        let snapshot = agent.clone();
        drop(agents);
        self.persist(&snapshot).await;
        true
    }

    pub async fn increment_builds(&self, id: ResourceId) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        if agent.current_builds >= agent.max_builds {
            return Err(Error::AgentUnavailable(format!(
                "agent {} at capacity",
                agent.name
            )));
        }
        agent.current_builds += 1;
        let snapshot = agent.clone();
        drop(agents);
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Floors at zero.
    pub async fn decrement_builds(&self, id: ResourceId) {
        let mut agents = self.agents.lock().await;
        if let Some(agent) = agents.get_mut(&id) {
            agent.current_builds = agent.current_builds.saturating_sub(1);
            let snapshot = agent.clone();
            drop(agents);
            self.persist(&snapshot).await;
        }
    }

    /// Pick the best available agent: online, capacity left, labels cover
    /// the requirement, resource floors met, caller's filter passes. Lowest
    /// score wins.
    pub async fn find_available_agent<F>(
        &self,
        required_labels: &BTreeSet<String>,
        hints: &ResourceHints,
        filter: F,
    ) -> Option<Agent>
    where
        F: Fn(&Agent) -> bool,
    {
        let agents = self.agents.lock().await;
        agents
            .values()
            .filter(|a| a.status == AgentStatus::Online)
            .filter(|a| a.has_capacity())
            .filter(|a| a.has_labels(required_labels))
            .filter(|a| meets_floors(a, hints))
            .filter(|a| filter(a))
            .min_by(|a, b| {
                self.score(a, hints)
                    .total_cmp(&self.score(b, hints))
            })
            .cloned()
    }

    fn score(&self, agent: &Agent, hints: &ResourceHints) -> f64 {
        if !self.resource_aware {
            return agent.current_builds as f64;
        }
        let load = if agent.max_builds == 0 {
            100.0
        } else {
            agent.current_builds as f64 / agent.max_builds as f64 * 100.0
        };
        let mut score = load;
        if let (Some(want), Some(have)) = (&hints.region, &agent.region) {
            if want == have {
                score -= 25.0;
            }
        }
        score -= (agent.system.cpu_count as f64).min(16.0);
        score -= (agent.system.memory_mb as f64 / 1024.0).min(16.0);
        score
    }

    /// Age out silent agents. Returns how many flipped online→offline.
    pub async fn check_agent_health(&self, heartbeat_timeout: Duration) -> usize {
        let cutoff = Utc::now() - heartbeat_timeout;
        let mut flipped = Vec::new();
        {
            let mut agents = self.agents.lock().await;
            for agent in agents.values_mut() {
                if agent.status == AgentStatus::Online && agent.last_heartbeat < cutoff {
                    warn!(agent = %agent.name, "agent heartbeat stale, marking offline");
                    agent.status = AgentStatus::Offline;
                    flipped.push(agent.clone());
                }
            }
        }
        for agent in &flipped {
            self.persist(agent).await;
        }
        flipped.len()
    }

    /// Deregister agents that stayed offline past the TTL.
    pub async fn expire_offline(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let expired: Vec<ResourceId> = {
            let agents = self.agents.lock().await;
            agents
                .values()
                .filter(|a| a.status == AgentStatus::Offline && a.last_heartbeat < cutoff)
                .map(|a| a.id)
                .collect()
        };
        for id in &expired {
            self.deregister(*id).await;
        }
        expired.len()
    }

    /// Draining agents are never selected; in-flight builds continue.
    pub async fn set_agent_draining(&self, id: ResourceId) -> Result<()> {
        let mut agents = self.agents.lock().await;
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("agent {id}")))?;
        agent.status = AgentStatus::Draining;
        let snapshot = agent.clone();
        drop(agents);
        self.persist(&snapshot).await;
        Ok(())
    }

    pub async fn deregister(&self, id: ResourceId) {
        let removed = self.agents.lock().await.remove(&id);
        if let Some(agent) = removed {
            info!(agent = %agent.name, "agent deregistered");
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(id).await {
                    warn!(error = %e, "failed to delete persisted agent");
                }
            }
        }
    }

    pub async fn get(&self, id: ResourceId) -> Option<Agent> {
        self.agents.lock().await.get(&id).cloned()
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        let agents = self.agents.lock().await;
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Ids of agents currently offline.
    pub async fn offline_agents(&self) -> Vec<ResourceId> {
        let agents = self.agents.lock().await;
        agents
            .values()
            .filter(|a| a.status == AgentStatus::Offline)
            .map(|a| a.id)
            .collect()
    }

    pub async fn registry_summary(&self) -> RegistrySummary {
        let agents = self.agents.lock().await;
        let mut summary = RegistrySummary {
            total: agents.len(),
            ..Default::default()
        };
        for agent in agents.values() {
            match agent.status {
                AgentStatus::Online => summary.online += 1,
                AgentStatus::Offline => summary.offline += 1,
                AgentStatus::Draining => summary.draining += 1,
            }
            summary.total_capacity += agent.max_builds;
            summary.builds_in_flight += agent.current_builds;
        }
        summary
    }

    async fn persist(&self, agent: &Agent) {
        if let Some(store) = &self.store {
            if let Err(e) = store.upsert(agent).await {
                warn!(agent = %agent.name, error = %e, "agent write-through failed");
            }
        }
    }
}

fn meets_floors(agent: &Agent, hints: &ResourceHints) -> bool {
    if let Some(min_cpu) = hints.min_cpu {
        if agent.system.cpu_count < min_cpu {
            return false;
        }
    }
    if let Some(min_mem) = hints.min_memory_mb {
        if agent.system.memory_mb < min_mem {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::agent::SystemInfo;

    fn registration(name: &str, labels: &[&str], max: u32) -> AgentRegistration {
        AgentRegistration {
            name: name.to_string(),
            url: format!("http://{name}:9090"),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            max_builds: max,
            system: SystemInfo {
                cpu_count: 4,
                memory_mb: 8192,
            },
            region: None,
            org_id: None,
        }
    }

    fn labels(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn register_upserts_by_name() {
        let registry = AgentRegistry::new(None, false);
        let first = registry.register(registration("a1", &["linux"], 2)).await.unwrap();
        let second = registry
            .register(registration("a1", &["linux", "gpu"], 4))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.max_builds, 4);
        assert_eq!(registry.list_agents().await.len(), 1);
    }

    #[tokio::test]
    async fn selection_filters_labels_status_and_capacity() {
        let registry = AgentRegistry::new(None, false);
        let linux = registry.register(registration("linux1", &["linux"], 1)).await.unwrap();
        registry.register(registration("mac1", &["mac"], 1)).await.unwrap();

        let found = registry
            .find_available_agent(&labels(&["linux"]), &ResourceHints::default(), |_| true)
            .await
            .unwrap();
        assert_eq!(found.id, linux.id);

        assert!(registry
            .find_available_agent(&labels(&["gpu"]), &ResourceHints::default(), |_| true)
            .await
            .is_none());

        registry.increment_builds(linux.id).await.unwrap();
        assert!(registry
            .find_available_agent(&labels(&["linux"]), &ResourceHints::default(), |_| true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn least_loaded_wins_when_flag_off() {
        let registry = AgentRegistry::new(None, false);
        let busy = registry.register(registration("busy", &["linux"], 4)).await.unwrap();
        let idle = registry.register(registration("idle", &["linux"], 4)).await.unwrap();
        registry.increment_builds(busy.id).await.unwrap();
        registry.increment_builds(busy.id).await.unwrap();

        let found = registry
            .find_available_agent(&labels(&["linux"]), &ResourceHints::default(), |_| true)
            .await
            .unwrap();
        assert_eq!(found.id, idle.id);
    }

    #[tokio::test]
    async fn region_locality_preferred_when_resource_aware() {
        let registry = AgentRegistry::new(None, true);
        let mut far = registration("far", &["linux"], 4);
        far.region = Some("us-west".to_string());
        let mut near = registration("near", &["linux"], 4);
        near.region = Some("eu-central".to_string());
        registry.register(far).await.unwrap();
        let near = registry.register(near).await.unwrap();

        let hints = ResourceHints {
            region: Some("eu-central".to_string()),
            ..Default::default()
        };
        let found = registry
            .find_available_agent(&labels(&["linux"]), &hints, |_| true)
            .await
            .unwrap();
        assert_eq!(found.id, near.id);
    }

    #[tokio::test]
    async fn resource_floors_filter_agents() {
        let registry = AgentRegistry::new(None, true);
        registry.register(registration("small", &["linux"], 4)).await.unwrap();
        let hints = ResourceHints {
            min_cpu: Some(8),
            ..Default::default()
        };
        assert!(registry
            .find_available_agent(&labels(&["linux"]), &hints, |_| true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn counters_floor_at_zero_and_cap_at_max() {
        let registry = AgentRegistry::new(None, false);
        let agent = registry.register(registration("a", &[], 1)).await.unwrap();
        registry.decrement_builds(agent.id).await;
        assert_eq!(registry.get(agent.id).await.unwrap().current_builds, 0);
        registry.increment_builds(agent.id).await.unwrap();
        assert!(registry.increment_builds(agent.id).await.is_err());
    }

    #[tokio::test]
    async fn health_check_ages_out_silent_agents() {
        let registry = AgentRegistry::new(None, false);
        let agent = registry.register(registration("quiet", &[], 1)).await.unwrap();
        // Zero timeout: everything is stale.
        let flipped = registry.check_agent_health(Duration::milliseconds(0)).await;
        assert_eq!(flipped, 1);
        assert_eq!(
            registry.get(agent.id).await.unwrap().status,
            AgentStatus::Offline
        );
        // Heartbeat brings it back.
        assert!(registry.heartbeat(agent.id, HeartbeatUpdate::default()).await);
        assert_eq!(
            registry.get(agent.id).await.unwrap().status,
            AgentStatus::Online
        );
    }

    #[tokio::test]
    async fn draining_agents_are_never_selected() {
        let registry = AgentRegistry::new(None, false);
        let agent = registry.register(registration("d", &["linux"], 2)).await.unwrap();
        registry.set_agent_draining(agent.id).await.unwrap();
        assert!(registry
            .find_available_agent(&labels(&[]), &ResourceHints::default(), |_| true)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn summary_counts() {
        let registry = AgentRegistry::new(None, false);
        let a = registry.register(registration("a", &[], 2)).await.unwrap();
        registry.register(registration("b", &[], 3)).await.unwrap();
        registry.increment_builds(a.id).await.unwrap();

        let summary = registry.registry_summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.online, 2);
        assert_eq!(summary.total_capacity, 5);
        assert_eq!(summary.builds_in_flight, 1);
    }
}
