//! In-process pub/sub bus.
//!
//! Subscriptions are keyed by a closed event-type enum. Each subscriber
//! buffers events until it acknowledges them by monotonic id; duplicate
//! `(api_cmd, correlation)` events coalesce while pending and are re-queued
//! once after the next ack so the subscriber re-fetches exactly once.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

use crate::stats::Statistics;

macro_rules! event_types {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Every event the engine can emit.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub enum EventType {
            $($variant),+
        }

        impl EventType {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl FromStr for EventType {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!("unknown event type: {other}")),
                }
            }
        }
    };
}

event_types! {
    InstanceStarted => "INSTANCE_STARTED",
    InstanceTerminated => "INSTANCE_TERMINATED",
    InstanceRemoved => "INSTANCE_REMOVED",
    InstanceTagged => "INSTANCE_TAGGED",
    InstanceUntagged => "INSTANCE_UNTAGGED",
    TaskEnqueue => "TASK_ENQUEUE",
    TaskExecute => "TASK_EXECUTE",
    TaskTerminate => "TASK_TERMINATE",
    TaskProgress => "TASK_PROGRESS",
    QueueEnqueue => "QUEUE_ENQUEUE",
    QueueDequeue => "QUEUE_DEQUEUE",
    QueueExecute => "QUEUE_EXECUTE",
    QueueTerminate => "QUEUE_TERMINATE",
    QueueCreated => "QUEUE_CREATED",
    QueueModified => "QUEUE_MODIFIED",
    QueueRemoved => "QUEUE_REMOVED",
    TagCreated => "TAG_CREATED",
    TagModified => "TAG_MODIFIED",
    TagRemoved => "TAG_REMOVED",
    WorkflowCreated => "WORKFLOW_CREATED",
    WorkflowModified => "WORKFLOW_MODIFIED",
    WorkflowRemoved => "WORKFLOW_REMOVED",
    WorkflowSubscribed => "WORKFLOW_SUBSCRIBED",
    WorkflowUnsubscribed => "WORKFLOW_UNSUBSCRIBED",
    WorkflowScheduleCreated => "WORKFLOW_SCHEDULE_CREATED",
    WorkflowScheduleModified => "WORKFLOW_SCHEDULE_MODIFIED",
    WorkflowScheduleRemoved => "WORKFLOW_SCHEDULE_REMOVED",
    WorkflowScheduleStarted => "WORKFLOW_SCHEDULE_STARTED",
    WorkflowScheduleStopped => "WORKFLOW_SCHEDULE_STOPPED",
    RetryScheduleCreated => "RETRYSCHEDULE_CREATED",
    RetryScheduleModified => "RETRYSCHEDULE_MODIFIED",
    RetryScheduleRemoved => "RETRYSCHEDULE_REMOVED",
    NotificationTypeCreated => "NOTIFICATION_TYPE_CREATED",
    NotificationTypeRemoved => "NOTIFICATION_TYPE_REMOVED",
    NotificationCreated => "NOTIFICATION_CREATED",
    NotificationModified => "NOTIFICATION_MODIFIED",
    NotificationRemoved => "NOTIFICATION_REMOVED",
    UserCreated => "USER_CREATED",
    UserModified => "USER_MODIFIED",
    UserRemoved => "USER_REMOVED",
    ChannelCreated => "CHANNEL_CREATED",
    ChannelModified => "CHANNEL_MODIFIED",
    ChannelRemoved => "CHANNEL_REMOVED",
    ChannelGroupCreated => "CHANNELGROUP_CREATED",
    ChannelGroupModified => "CHANNELGROUP_MODIFIED",
    ChannelGroupRemoved => "CHANNELGROUP_REMOVED",
    LogEngine => "LOG_ENGINE",
    LogNotification => "LOG_NOTIFICATION",
    LogApi => "LOG_API",
    LogElog => "LOG_ELOG",
    GitPulled => "GIT_PULLED",
    GitSaved => "GIT_SAVED",
    GitLoaded => "GIT_LOADED",
    GitRemoved => "GIT_REMOVED",
}

impl EventType {
    /// Log notices are droppable under backpressure.
    fn low_priority(&self) -> bool {
        matches!(
            self,
            Self::LogEngine | Self::LogNotification | Self::LogApi | Self::LogElog
        )
    }
}

/// Opaque subscriber handle, chosen by the session layer.
pub type SubscriberId = u64;

/// A buffered event awaiting acknowledgement.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_id: u64,
    pub event_type: EventType,
    pub object_id: u64,
    pub api_cmd: String,
    pub correlation: i64,
    /// Set when a duplicate arrived while this event was pending; the
    /// subscriber should re-fetch once after acknowledging.
    pub need_resend: bool,
}

#[derive(Debug, Clone)]
struct Subscription {
    subscriber: SubscriberId,
    /// 0 matches every object.
    object_filter: u64,
    correlation: i64,
    api_cmd: String,
}

#[derive(Default)]
struct BusState {
    next_event_id: u64,
    subscriptions: HashMap<EventType, Vec<Subscription>>,
    pending: HashMap<SubscriberId, Vec<Event>>,
    wakers: HashMap<SubscriberId, Arc<Notify>>,
}

/// The events bus. One per node; all operations take the single bus mutex,
/// which also makes event-id assignment totally ordered.
pub struct EventsBus {
    state: Mutex<BusState>,
    throttling: AtomicBool,
    stats: Arc<Statistics>,
}

impl EventsBus {
    pub fn new(stats: Arc<Statistics>) -> Self {
        Self {
            state: Mutex::new(BusState {
                next_event_id: 1,
                ..Default::default()
            }),
            throttling: AtomicBool::new(false),
            stats,
        }
    }

    /// Register a waker for a subscriber; the returned handle is notified
    /// whenever an event lands in its buffer.
    pub fn register(&self, subscriber: SubscriberId) -> Arc<Notify> {
        let mut state = self.state.lock().unwrap();
        state
            .wakers
            .entry(subscriber)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn subscribe(
        &self,
        subscriber: SubscriberId,
        event_type: EventType,
        object_filter: u64,
        correlation: i64,
        api_cmd: impl Into<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .entry(event_type)
            .or_default()
            .push(Subscription {
                subscriber,
                object_filter,
                correlation,
                api_cmd: api_cmd.into(),
            });
        self.stats
            .event_subscriptions
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Remove one subscription (matching filter and correlation).
    pub fn unsubscribe(
        &self,
        subscriber: SubscriberId,
        event_type: EventType,
        object_filter: u64,
        correlation: i64,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(subs) = state.subscriptions.get_mut(&event_type) {
            let before = subs.len();
            subs.retain(|s| {
                !(s.subscriber == subscriber
                    && s.object_filter == object_filter
                    && s.correlation == correlation)
            });
            let removed = (before - subs.len()) as i64;
            self.stats
                .event_subscriptions
                .fetch_sub(removed, Ordering::Relaxed);
        }
    }

    /// Drop every subscription, pending event and waker of a subscriber
    /// (session teardown).
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for subs in state.subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.subscriber != subscriber);
            removed += (before - subs.len()) as i64;
        }
        state.pending.remove(&subscriber);
        state.wakers.remove(&subscriber);
        self.stats
            .event_subscriptions
            .fetch_sub(removed, Ordering::Relaxed);
    }

    /// Emit an event. Delivery is immediate: the event is appended to (or
    /// coalesced into) every matching subscriber's buffer under the bus
    /// mutex, so subscribers observe events in insertion order.
    pub fn create(&self, event_type: EventType, object_id: u64) {
        if self.throttling.load(Ordering::Relaxed) && event_type.low_priority() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        let Some(subs) = state.subscriptions.get(&event_type) else {
            return;
        };

        let matching: Vec<Subscription> = subs
            .iter()
            .filter(|s| s.object_filter == 0 || s.object_filter == object_id)
            .cloned()
            .collect();
        if matching.is_empty() {
            return;
        }

        for sub in matching {
            let buffer = state.pending.entry(sub.subscriber).or_default();

            // Coalesce with a pending event for the same command and
            // correlation tag.
            if let Some(existing) = buffer
                .iter_mut()
                .find(|e| e.api_cmd == sub.api_cmd && e.correlation == sub.correlation)
            {
                existing.need_resend = true;
                continue;
            }

            let event_id = state.next_event_id;
            state.next_event_id += 1;

            state.pending.entry(sub.subscriber).or_default().push(Event {
                event_id,
                event_type,
                object_id,
                api_cmd: sub.api_cmd.clone(),
                correlation: sub.correlation,
                need_resend: false,
            });
            self.stats.events_emitted.fetch_add(1, Ordering::Relaxed);

            if let Some(waker) = state.wakers.get(&sub.subscriber) {
                waker.notify_one();
            }
        }
    }

    /// Pending events for a subscriber, ascending by id. Events stay
    /// buffered until acknowledged.
    pub fn get(&self, subscriber: SubscriberId) -> Vec<Event> {
        let state = self.state.lock().unwrap();
        let mut events = state.pending.get(&subscriber).cloned().unwrap_or_default();
        events.sort_by_key(|e| e.event_id);
        events
    }

    /// Acknowledge every event with `id <= event_id`. Coalesced events are
    /// re-queued with a fresh id so the subscriber fetches them once more.
    pub fn ack(&self, subscriber: SubscriberId, event_id: u64) {
        let mut state = self.state.lock().unwrap();

        let Some(buffer) = state.pending.get_mut(&subscriber) else {
            return;
        };
        let mut resend = Vec::new();
        buffer.retain(|e| {
            if e.event_id <= event_id {
                if e.need_resend {
                    resend.push(e.clone());
                }
                false
            } else {
                true
            }
        });

        let mut woke = false;
        for mut event in resend {
            event.event_id = state.next_event_id;
            state.next_event_id += 1;
            event.need_resend = false;
            state.pending.entry(subscriber).or_default().push(event);
            woke = true;
        }
        if woke {
            if let Some(waker) = state.wakers.get(&subscriber) {
                waker.notify_one();
            }
        }
    }

    /// Under backpressure, drop low-priority events at the source.
    pub fn set_throttling(&self, on: bool) {
        self.throttling.store(on, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventsBus {
        EventsBus::new(Arc::new(Statistics::new()))
    }

    #[test]
    fn event_type_round_trip() {
        for t in [
            EventType::InstanceStarted,
            EventType::TaskTerminate,
            EventType::QueueDequeue,
            EventType::LogEngine,
            EventType::GitPulled,
        ] {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("NOT_A_TYPE".parse::<EventType>().is_err());
    }

    #[test]
    fn delivery_respects_object_filter() {
        let bus = bus();
        bus.subscribe(1, EventType::InstanceStarted, 7, 0, "status");
        bus.subscribe(2, EventType::InstanceStarted, 0, 0, "status");

        bus.create(EventType::InstanceStarted, 9);

        assert!(bus.get(1).is_empty());
        assert_eq!(bus.get(2).len(), 1);
        assert_eq!(bus.get(2)[0].object_id, 9);
    }

    #[test]
    fn ids_are_monotonic_and_ordered() {
        let bus = bus();
        bus.subscribe(1, EventType::TaskTerminate, 0, 1, "a");
        bus.subscribe(1, EventType::TaskExecute, 0, 2, "b");

        bus.create(EventType::TaskExecute, 1);
        bus.create(EventType::TaskTerminate, 1);
        bus.create(EventType::TaskExecute, 2);

        let events = bus.get(1);
        // TaskExecute #2 coalesced into the pending one, so two remain.
        assert_eq!(events.len(), 2);
        assert!(events[0].event_id < events[1].event_id);
    }

    #[test]
    fn ack_removes_up_to_id() {
        let bus = bus();
        bus.subscribe(1, EventType::InstanceStarted, 0, 1, "a");
        bus.subscribe(1, EventType::InstanceTerminated, 0, 2, "b");

        bus.create(EventType::InstanceStarted, 1);
        bus.create(EventType::InstanceTerminated, 1);

        let events = bus.get(1);
        let first = events[0].event_id;

        bus.ack(1, first);
        let rest = bus.get(1);
        assert_eq!(rest.len(), 1);
        assert!(rest.iter().all(|e| e.event_id > first));
    }

    #[test]
    fn coalesced_event_resends_once_after_ack() {
        let bus = bus();
        bus.subscribe(1, EventType::TaskProgress, 0, 5, "progress");

        bus.create(EventType::TaskProgress, 1);
        bus.create(EventType::TaskProgress, 1);
        bus.create(EventType::TaskProgress, 1);

        // Coalesced to a single pending event flagged for resend.
        let events = bus.get(1);
        assert_eq!(events.len(), 1);
        assert!(events[0].need_resend);
        let id = events[0].event_id;

        bus.ack(1, id);

        // Re-queued once with a fresh id.
        let events = bus.get(1);
        assert_eq!(events.len(), 1);
        assert!(events[0].event_id > id);
        assert!(!events[0].need_resend);

        bus.ack(1, events[0].event_id);
        assert!(bus.get(1).is_empty());
    }

    #[test]
    fn throttling_drops_log_events_only() {
        let bus = bus();
        bus.subscribe(1, EventType::LogEngine, 0, 1, "logs");
        bus.subscribe(1, EventType::InstanceStarted, 0, 2, "status");

        bus.set_throttling(true);
        bus.create(EventType::LogEngine, 0);
        bus.create(EventType::InstanceStarted, 3);

        let events = bus.get(1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::InstanceStarted);
    }

    #[test]
    fn unsubscribe_all_clears_state() {
        let bus = bus();
        bus.subscribe(1, EventType::InstanceStarted, 0, 0, "a");
        bus.create(EventType::InstanceStarted, 1);
        bus.unsubscribe_all(1);

        assert!(bus.get(1).is_empty());
        bus.create(EventType::InstanceStarted, 2);
        assert!(bus.get(1).is_empty());
    }

    #[tokio::test]
    async fn waker_fires_on_delivery() {
        let bus = bus();
        let waker = bus.register(1);
        bus.subscribe(1, EventType::InstanceStarted, 0, 0, "a");

        bus.create(EventType::InstanceStarted, 1);
        // notified() resolves immediately thanks to the stored permit.
        tokio::time::timeout(std::time::Duration::from_secs(1), waker.notified())
            .await
            .expect("waker should have been notified");
    }
}
