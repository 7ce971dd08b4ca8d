//! Event bus: in-memory fan-out plus the durable event log.
//!
//! Every published event is written to the event store, then delivered to
//! every subscriber of that build without blocking the publisher. A slow
//! subscriber's step-log events are coalesced under buffer pressure; other
//! events past the bounded buffer are dropped and the subscriber receives a
//! single synthetic `event-dropped` noting the gap once it catches up.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, warn};

use chengis_core::ResourceId;
use chengis_core::event::{
    BuildEvent, BuildEventKind, EventId, EventIdGen, EventSink, NewBuildEvent,
};
use chengis_db::EventRepo;

/// Per-subscriber channel capacity.
const SUBSCRIBER_BUFFER: usize = 256;
/// Cap on a coalesced step-log body.
const COALESCE_LIMIT: usize = 64 * 1024;

struct Subscriber {
    tx: mpsc::Sender<BuildEvent>,
    /// Merged step-log event waiting for channel room.
    coalesced: Option<BuildEvent>,
    /// Events lost since the last successful delivery.
    dropped: u64,
}

/// In-memory broadcast plus durable log with replay cursor.
pub struct EventBus {
    store: Arc<dyn EventRepo>,
    ids: EventIdGen,
    subscribers: Mutex<HashMap<ResourceId, Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventRepo>) -> Self {
        Self {
            store,
            ids: EventIdGen::new(),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a build's live events.
    pub async fn subscribe(&self, build_id: ResourceId) -> mpsc::Receiver<BuildEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subs = self.subscribers.lock().await;
        subs.entry(build_id).or_default().push(Subscriber {
            tx,
            coalesced: None,
            dropped: 0,
        });
        rx
    }

    /// Replay the durable log: events with id > `since_id`, ascending.
    pub async fn replay(
        &self,
        build_id: ResourceId,
        since_id: EventId,
        limit: i64,
    ) -> chengis_core::Result<Vec<BuildEvent>> {
        self.store
            .replay(build_id, since_id, limit)
            .await
            .map_err(Into::into)
    }

    /// Assign an id, persist, fan out. Returns the durable event.
    pub async fn publish(&self, build_id: ResourceId, new: NewBuildEvent) -> BuildEvent {
        let event = BuildEvent {
            id: self.ids.next(build_id),
            build_id,
            kind: new.kind,
            stage: new.stage,
            step: new.step,
            payload: new.payload,
            at: Utc::now(),
        };

        // Durable log first; the replay log is the source of truth.
        if let Err(e) = self.store.append(&event).await {
            error!(build_id = %build_id, error = %e, "failed to persist build event");
        }

        let mut subs = self.subscribers.lock().await;
        if let Some(list) = subs.get_mut(&build_id) {
            list.retain_mut(|sub| Self::deliver(&self.ids, build_id, sub, event.clone()));
            if list.is_empty() {
                subs.remove(&build_id);
            }
        }
        event
    }

    /// Drop subscriber bookkeeping for a finished build.
    pub async fn forget(&self, build_id: ResourceId) {
        self.subscribers.lock().await.remove(&build_id);
        self.ids.forget(build_id);
    }

    /// Non-blocking delivery; returns false when the subscriber is gone.
    fn deliver(
        ids: &EventIdGen,
        build_id: ResourceId,
        sub: &mut Subscriber,
        event: BuildEvent,
    ) -> bool {
        // Flush a pending coalesced fragment first to preserve ordering.
        if let Some(pending) = sub.coalesced.take() {
            match sub.tx.try_send(pending) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(pending)) => {
                    if event.kind == BuildEventKind::StepLog {
                        sub.coalesced = Some(merge_step_logs(pending, &event, &mut sub.dropped));
                        return true;
                    }
                    sub.coalesced = Some(pending);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
        }

        // Announce a gap before anything that follows it.
        if sub.dropped > 0 {
            let notice = BuildEvent {
                id: ids.next(build_id),
                build_id,
                kind: BuildEventKind::EventDropped,
                stage: None,
                step: None,
                payload: serde_json::json!({ "dropped": sub.dropped }),
                at: Utc::now(),
            };
            match sub.tx.try_send(notice) {
                Ok(()) => sub.dropped = 0,
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match sub.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                if event.kind == BuildEventKind::StepLog {
                    sub.coalesced = Some(event);
                } else {
                    warn!(build_id = %build_id, kind = ?event.kind, "subscriber lagging, dropping event");
                    sub.dropped += 1;
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Append `next`'s text onto a pending step-log event, bounded.
fn merge_step_logs(mut pending: BuildEvent, next: &BuildEvent, dropped: &mut u64) -> BuildEvent {
    let next_text = next
        .payload
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    let pending_text = pending
        .payload
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    if pending_text.len() + next_text.len() > COALESCE_LIMIT {
        *dropped += 1;
        return pending;
    }
    let merged = format!("{pending_text}{next_text}");
    if let Some(obj) = pending.payload.as_object_mut() {
        obj.insert("text".to_string(), serde_json::Value::String(merged));
        obj.insert("coalesced".to_string(), serde_json::Value::Bool(true));
    }
    pending.id = next.id;
    pending
}

#[async_trait::async_trait]
impl EventSink for EventBus {
    async fn emit(&self, build_id: ResourceId, event: NewBuildEvent) {
        self.publish(build_id, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_db::memory::MemoryStore;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(MemoryStore::new()))
    }

    fn log_event(text: &str) -> NewBuildEvent {
        NewBuildEvent::new(BuildEventKind::StepLog)
            .stage("build")
            .step("sh")
            .payload(serde_json::json!({ "stream": "stdout", "text": text }))
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_order() {
        let bus = bus();
        let build = ResourceId::new();
        let mut rx = bus.subscribe(build).await;

        bus.publish(build, NewBuildEvent::new(BuildEventKind::BuildStarted))
            .await;
        bus.publish(build, log_event("hello")).await;
        bus.publish(build, NewBuildEvent::new(BuildEventKind::BuildCompleted))
            .await;

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(a.kind, BuildEventKind::BuildStarted);
        assert_eq!(b.kind, BuildEventKind::StepLog);
        assert_eq!(c.kind, BuildEventKind::BuildCompleted);
        assert!(a.id < b.id && b.id < c.id);
    }

    #[tokio::test]
    async fn replay_returns_events_after_cursor() {
        let bus = bus();
        let build = ResourceId::new();
        let first = bus
            .publish(build, NewBuildEvent::new(BuildEventKind::BuildStarted))
            .await;
        bus.publish(build, log_event("a")).await;
        bus.publish(build, NewBuildEvent::new(BuildEventKind::BuildCompleted))
            .await;

        let all = bus.replay(build, 0, 100).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let after = bus.replay(build, first.id, 100).await.unwrap();
        assert_eq!(after.len(), 2);
        assert!(after.iter().all(|e| e.id > first.id));
    }

    #[tokio::test]
    async fn publishers_never_block_on_slow_subscribers() {
        let bus = bus();
        let build = ResourceId::new();
        // Subscriber that never drains.
        let _rx = bus.subscribe(build).await;

        // Far beyond buffer capacity; must not deadlock.
        for i in 0..(SUBSCRIBER_BUFFER * 4) {
            bus.publish(build, log_event(&format!("line {i}\n"))).await;
        }
        // Durable log still has everything.
        let all = bus.replay(build, 0, 10_000).await.unwrap();
        assert_eq!(all.len(), SUBSCRIBER_BUFFER * 4);
    }

    #[tokio::test]
    async fn slow_subscriber_gets_dropped_notice() {
        let bus = bus();
        let build = ResourceId::new();
        let mut rx = bus.subscribe(build).await;

        // Overflow with non-log events (these drop rather than coalesce).
        for _ in 0..(SUBSCRIBER_BUFFER + 50) {
            bus.publish(build, NewBuildEvent::new(BuildEventKind::StageStarted).stage("s"))
                .await;
        }
        // Drain; a new publish can now announce the gap.
        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), SUBSCRIBER_BUFFER);

        bus.publish(build, NewBuildEvent::new(BuildEventKind::BuildCompleted))
            .await;
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, BuildEventKind::EventDropped);
        assert_eq!(notice.payload["dropped"].as_u64(), Some(50));
        let last = rx.recv().await.unwrap();
        assert_eq!(last.kind, BuildEventKind::BuildCompleted);
    }

    #[tokio::test]
    async fn step_logs_coalesce_under_pressure() {
        let bus = bus();
        let build = ResourceId::new();
        let mut rx = bus.subscribe(build).await;

        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            bus.publish(build, log_event(&format!("{i};"))).await;
        }
        let mut received = Vec::new();
        while let Ok(event) = rx.try_recv() {
            received.push(event);
        }
        // One more publish flushes the coalesced remainder.
        bus.publish(build, log_event("tail;")).await;
        let flushed = rx.recv().await.unwrap();
        assert_eq!(flushed.kind, BuildEventKind::StepLog);
        assert_eq!(flushed.payload["coalesced"].as_bool(), Some(true));
        // Nothing was lost: buffer + coalesced fragment cover all lines.
        let text = flushed.payload["text"].as_str().unwrap();
        assert!(text.contains(&format!("{};", SUBSCRIBER_BUFFER)));
    }
}
