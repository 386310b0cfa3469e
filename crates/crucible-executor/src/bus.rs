//! The build event bus.
//!
//! Two planes. Durable: every event is appended to the event store first,
//! under a process-wide total-order id; persistence failures are logged and
//! never block delivery. Ephemeral: the event then fans out to in-memory
//! subscribers keyed by build id, each holding a bounded sliding window.
//! When a window fills, the oldest non-critical event is dropped in
//! publication order; critical events wait a bounded time for space before
//! being dropped and flagged.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, warn};

use crucible_core::ResourceId;
use crucible_core::event::{BuildEvent, EventId, EventIdGenerator, EventKind};
use crucible_core::store::EventStore;
use crucible_core::Result;

/// Events buffered per subscriber before the window slides.
const DEFAULT_WINDOW: usize = 256;

/// How long a critical event waits for window space before drop+flag.
const CRITICAL_PUBLISH_WAIT: Duration = Duration::from_secs(2);

/// Upper bound on the store backfill a fresh subscription receives.
const REPLAY_PAGE: usize = 10_000;

struct SubscriptionInner {
    window: Mutex<VecDeque<BuildEvent>>,
    capacity: usize,
    /// Signalled when an event lands in the window.
    available: Notify,
    /// Signalled when the consumer frees space.
    space: Notify,
    /// Set when a critical event had to be dropped.
    lagged: AtomicBool,
    closed: AtomicBool,
}

/// A live event subscription for one build.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    /// Replay cursor: live events at or before this id were already
    /// delivered from the store.
    skip_through: Option<EventId>,
}

impl Subscription {
    /// Next event in publication order, or None once the subscription is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<BuildEvent> {
        loop {
            {
                let mut window = self.inner.window.lock().unwrap();
                while let Some(event) = window.pop_front() {
                    self.inner.space.notify_one();
                    let already_replayed = self
                        .skip_through
                        .as_ref()
                        .is_some_and(|cursor| event.event_id <= *cursor);
                    if !already_replayed {
                        drop(window);
                        return Some(event);
                    }
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.available.notified().await;
        }
    }

    /// Whether any critical event was dropped for this subscriber.
    pub fn lagged(&self) -> bool {
        self.inner.lagged.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

enum Offer {
    Delivered,
    WindowFullOfCritical,
}

impl SubscriptionInner {
    fn offer(&self, event: &BuildEvent) -> Offer {
        let mut window = self.window.lock().unwrap();
        if window.len() >= self.capacity {
            // Slide: drop the oldest non-critical event.
            if let Some(position) = window.iter().position(|e| !e.kind.is_critical()) {
                window.remove(position);
            } else if event.kind.is_critical() {
                return Offer::WindowFullOfCritical;
            } else {
                // Incoming non-critical event loses to a window of critical
                // ones.
                return Offer::Delivered;
            }
        }
        window.push_back(event.clone());
        self.available.notify_one();
        Offer::Delivered
    }
}

/// Durable-then-broadcast fan-out of build events.
pub struct EventBus {
    store: Arc<dyn EventStore>,
    generator: EventIdGenerator,
    subscribers: Mutex<HashMap<ResourceId, Vec<Arc<SubscriptionInner>>>>,
    window: usize,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_window(store, DEFAULT_WINDOW)
    }

    pub fn with_window(store: Arc<dyn EventStore>, window: usize) -> Self {
        Self {
            store,
            generator: EventIdGenerator::new(),
            subscribers: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Build an event with the next total-order id.
    pub fn event(
        &self,
        build_id: ResourceId,
        org_id: ResourceId,
        kind: EventKind,
        stage_name: Option<String>,
        step_name: Option<String>,
        payload: serde_json::Value,
    ) -> BuildEvent {
        BuildEvent {
            event_id: self.generator.next(),
            build_id,
            org_id,
            kind,
            stage_name,
            step_name,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Persist, then fan out.
    pub async fn publish(&self, event: BuildEvent) {
        if let Err(e) = self.store.append(&event).await {
            // The ephemeral plane must keep flowing even when the store is
            // down.
            error!(
                build_id = %event.build_id,
                kind = event.kind.as_str(),
                error = %e,
                "event persistence failed"
            );
        }
        self.fan_out(event).await;
    }

    async fn fan_out(&self, event: BuildEvent) {
        let targets: Vec<Arc<SubscriptionInner>> = {
            let mut subscribers = self.subscribers.lock().unwrap();
            if let Some(list) = subscribers.get_mut(&event.build_id) {
                list.retain(|sub| !sub.closed.load(Ordering::Acquire));
                list.clone()
            } else {
                return;
            }
        };

        for target in targets {
            match target.offer(&event) {
                Offer::Delivered => {}
                Offer::WindowFullOfCritical => {
                    // Bounded wait for the consumer, then drop and flag.
                    let deadline = tokio::time::Instant::now() + CRITICAL_PUBLISH_WAIT;
                    let mut delivered = false;
                    while tokio::time::Instant::now() < deadline {
                        let wait = tokio::time::timeout_at(deadline, target.space.notified()).await;
                        if matches!(target.offer(&event), Offer::Delivered) {
                            delivered = true;
                            break;
                        }
                        if wait.is_err() {
                            break;
                        }
                    }
                    if !delivered {
                        target.lagged.store(true, Ordering::Relaxed);
                        warn!(
                            build_id = %event.build_id,
                            kind = event.kind.as_str(),
                            "critical event dropped for slow subscriber"
                        );
                    }
                }
            }
        }
    }

    /// Subscribe to live events for a build. With a cursor, events after it
    /// are first replayed from the store; the live stream resumes seamlessly
    /// after the replayed prefix.
    pub async fn subscribe(
        &self,
        build_id: ResourceId,
        after: Option<EventId>,
    ) -> Result<(Vec<BuildEvent>, Subscription)> {
        let inner = Arc::new(SubscriptionInner {
            window: Mutex::new(VecDeque::new()),
            capacity: self.window,
            available: Notify::new(),
            space: Notify::new(),
            lagged: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.subscribers
            .lock()
            .unwrap()
            .entry(build_id)
            .or_default()
            .push(inner.clone());

        // Register first, replay second: anything persisted after the
        // snapshot also lands in the live window and is deduplicated by the
        // cursor.
        let replayed = self.store.replay(build_id, after.as_ref(), REPLAY_PAGE).await?;
        let skip_through = replayed.last().map(|e| e.event_id.clone()).or(after);

        Ok((
            replayed,
            Subscription {
                inner,
                skip_through,
            },
        ))
    }

    /// Ordered events from the durable store.
    pub async fn replay(
        &self,
        build_id: ResourceId,
        after: Option<&EventId>,
        limit: usize,
    ) -> Result<Vec<BuildEvent>> {
        self.store.replay(build_id, after, limit).await
    }
}
