use std::sync::Mutex;

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::error::Result;
use crate::events::log::{Event, EventLog};
use crate::events::types;

/// Async subscriber callback. Errors are logged by the bus and never
/// propagate to the publisher.
pub type Subscriber =
    Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static>;

struct Subscription {
    event_types: Vec<String>,
    callback: Subscriber,
}

/// Ordered at-least-once event delivery.
///
/// `publish` writes the event durably (assigning the sequence number)
/// before invoking subscribers, so a crash mid-fan-out can always be
/// recovered by `replay`. Subscribers run in registration order and a
/// failing subscriber never blocks the rest.
pub struct EventBus {
    log: EventLog,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for a list of event types, or `["*"]` for all.
    pub fn subscribe(&self, event_types: &[&str], callback: Subscriber) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.push(Subscription {
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            callback,
        });
    }

    /// Persist and fan out an event, returning its sequence number.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source_id: Option<&str>,
    ) -> Result<i64> {
        let event = self.log.append(event_type, &payload, source_id)?;
        let seq = event.seq;

        let matching: Vec<Subscriber> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .iter()
                .filter(|s| {
                    s.event_types
                        .iter()
                        .any(|t| t == event_type || t == types::ALL)
                })
                .map(|s| s.callback.clone())
                .collect()
        };

        for callback in matching {
            if let Err(e) = callback(event.clone()).await {
                log::warn!("Event subscriber failed for {event_type} (seq {seq}): {e:#}");
            }
        }

        Ok(seq)
    }

    /// Replay persisted events with seq > `since_seq`.
    pub fn replay(&self, since_seq: i64) -> Result<Vec<Event>> {
        self.log.replay(since_seq)
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(EventLog::new(db::init_test_db())))
    }

    fn counting_subscriber(counter: Arc<AtomicUsize>) -> Subscriber {
        Arc::new(move |_event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_publish_assigns_seq_and_notifies() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&["device.new"], counting_subscriber(count.clone()));

        let seq1 = bus
            .publish("device.new", serde_json::json!({"id": 1}), None)
            .await
            .unwrap();
        let seq2 = bus
            .publish("device.new", serde_json::json!({"id": 2}), None)
            .await
            .unwrap();

        assert!(seq2 > seq1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscriber_only_receives_matching_types() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&["decoy.trip"], counting_subscriber(count.clone()));

        bus.publish("device.new", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish("decoy.trip", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_subscriber_receives_everything() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(&["*"], counting_subscriber(count.clone()));

        bus.publish("device.new", serde_json::json!({}), None)
            .await
            .unwrap();
        bus.publish("alert.new", serde_json::json!({}), None)
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = test_bus();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            &["*"],
            Arc::new(|_event| Box::pin(async { anyhow::bail!("subscriber exploded") })),
        );
        bus.subscribe(&["*"], counting_subscriber(count.clone()));

        let seq = bus
            .publish("device.new", serde_json::json!({}), None)
            .await
            .unwrap();

        // Event persisted and the second subscriber still ran.
        assert!(seq > 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_durable_before_fanout() {
        let bus = test_bus();
        bus.subscribe(
            &["*"],
            Arc::new(|_event| Box::pin(async { anyhow::bail!("boom") })),
        );

        let seq = bus
            .publish("decoy.credential_trip", serde_json::json!({"v": 1}), None)
            .await
            .unwrap();

        let replayed = bus.replay(seq - 1).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].event_type, "decoy.credential_trip");
    }
}
