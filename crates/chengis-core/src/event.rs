//! Build events.
//!
//! Every state transition and log fragment of a build is recorded as an
//! append-only event. Event ids are strictly increasing within a build:
//! time-based with a per-build tiebreaker so bursts in the same millisecond
//! stay ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::ResourceId;

/// Durable, time-ordered event id. Millisecond timestamp shifted left with
/// room for a per-build sequence in the low bits.
pub type EventId = i64;

const SEQ_BITS: u32 = 20;

/// An append-only record describing a state transition or log fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: EventId,
    pub build_id: ResourceId,
    pub kind: BuildEventKind,
    pub stage: Option<String>,
    pub step: Option<String>,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Event payload before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBuildEvent {
    pub kind: BuildEventKind,
    pub stage: Option<String>,
    pub step: Option<String>,
    pub payload: serde_json::Value,
}

impl NewBuildEvent {
    pub fn new(kind: BuildEventKind) -> Self {
        Self {
            kind,
            stage: None,
            step: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildEventKind {
    BuildStarted,
    StageStarted,
    StageCompleted,
    StepStarted,
    StepLog,
    StepCompleted,
    GatePending,
    BuildCompleted,
    BuildOrphaned,
    Cancelled,
    /// Synthetic event telling a slow subscriber how many events it missed.
    EventDropped,
}

impl BuildEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildEventKind::BuildStarted => "build-started",
            BuildEventKind::StageStarted => "stage-started",
            BuildEventKind::StageCompleted => "stage-completed",
            BuildEventKind::StepStarted => "step-started",
            BuildEventKind::StepLog => "step-log",
            BuildEventKind::StepCompleted => "step-completed",
            BuildEventKind::GatePending => "gate-pending",
            BuildEventKind::BuildCompleted => "build-completed",
            BuildEventKind::BuildOrphaned => "build-orphaned",
            BuildEventKind::Cancelled => "cancelled",
            BuildEventKind::EventDropped => "event-dropped",
        }
    }
}

/// Assigns strictly increasing event ids per build.
#[derive(Debug, Default)]
pub struct EventIdGen {
    last: Mutex<HashMap<ResourceId, EventId>>,
}

impl EventIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for the build: `now_ms << SEQ_BITS`, bumped past the previous
    /// id when several events land in the same millisecond.
    pub fn next(&self, build_id: ResourceId) -> EventId {
        let candidate = Utc::now().timestamp_millis() << SEQ_BITS;
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let entry = last.entry(build_id).or_insert(0);
        let id = candidate.max(*entry + 1);
        *entry = id;
        id
    }

    /// Drop bookkeeping for a finished build.
    pub fn forget(&self, build_id: ResourceId) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.remove(&build_id);
    }
}

/// Seam through which components emit build events. Implementations persist
/// and/or fan out; emission never fails the caller.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, build_id: ResourceId, event: NewBuildEvent);
}

/// Sink that drops everything. Useful in tests and for fire-and-forget paths.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait::async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _build_id: ResourceId, _event: NewBuildEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_strictly_increase_within_a_build() {
        let generator = EventIdGen::new();
        let build = ResourceId::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let id = generator.next(build);
            assert!(id > prev, "{id} must be > {prev}");
            prev = id;
        }
    }

    #[test]
    fn ids_are_independent_across_builds() {
        let generator = EventIdGen::new();
        let a = ResourceId::new();
        let b = ResourceId::new();
        let a1 = generator.next(a);
        let b1 = generator.next(b);
        let a2 = generator.next(a);
        assert!(a2 > a1);
        // Builds in the same millisecond get the same time component.
        assert!(b1 >> SEQ_BITS >= a1 >> SEQ_BITS);
    }

    #[test]
    fn kind_names_match_wire_format() {
        assert_eq!(BuildEventKind::StepLog.as_str(), "step-log");
        assert_eq!(BuildEventKind::EventDropped.as_str(), "event-dropped");
        let json = serde_json::to_string(&BuildEventKind::BuildStarted).unwrap();
        assert_eq!(json, "\"build-started\"");
    }
}
