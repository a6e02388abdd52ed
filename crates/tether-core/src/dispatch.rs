//! Event dispatch pipeline.
//!
//! Every inbound event flows through an optional cache-update stage before
//! the business stage runs, so handlers always observe locally-consistent
//! cached state. The two stages are registered as one ordered pair per event
//! type rather than as independently-subscribed listeners: relative ordering
//! is guaranteed by construction, not by registration order.
//!
//! Failure isolation: an error returned by either stage is caught and logged
//! here and never propagates. One misbehaving handler cannot stall dispatch
//! of the other stage, of later envelopes, or of other event types.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::envelope::EventEnvelope;
use crate::error::HandlerResult;

/// A boxed handler stage.
pub type StageFn = Arc<dyn Fn(Value) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// The ordered pair of handler stages registered for one event type.
///
/// Either stage may be absent (cache-only or business-only events).
#[derive(Clone, Default)]
pub struct EventStages {
    cache_stage: Option<StageFn>,
    business_stage: Option<StageFn>,
}

impl EventStages {
    /// Creates an empty pair.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache stage: runs first, keeps local cached state consistent.
    pub fn cache<F, Fut>(mut self, stage: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.cache_stage = Some(Arc::new(move |payload| Box::pin(stage(payload))));
        self
    }

    /// Sets the business stage: runs after the cache stage has completed.
    pub fn business<F, Fut>(mut self, stage: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.business_stage = Some(Arc::new(move |payload| Box::pin(stage(payload))));
        self
    }

    /// True when neither stage is registered.
    pub fn is_empty(&self) -> bool {
        self.cache_stage.is_none() && self.business_stage.is_none()
    }
}

impl std::fmt::Debug for EventStages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStages")
            .field("cache_stage", &self.cache_stage.is_some())
            .field("business_stage", &self.business_stage.is_some())
            .finish()
    }
}

/// Registry mapping event type names to their handler stages.
///
/// Safe to share and mutate concurrently; registration after connect is
/// allowed and takes effect for subsequently dispatched envelopes.
#[derive(Default)]
pub struct EventRegistry {
    handlers: RwLock<HashMap<String, EventStages>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler stages for an event type, replacing any
    /// previous registration for that type.
    pub fn register(&self, event_type: impl Into<String>, stages: EventStages) {
        let event_type = event_type.into();
        debug!(event_type = %event_type, ?stages, "Registered event handler");
        self.handlers.write().insert(event_type, stages);
    }

    /// Returns the stages registered for an event type.
    pub fn get(&self, event_type: &str) -> Option<EventStages> {
        self.handlers.read().get(event_type).cloned()
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("event_types", &self.len())
            .finish()
    }
}

/// Dispatches envelopes from one shard through the registry.
///
/// One pipeline task runs per shard, consuming that shard's channel, so
/// envelopes from a single shard are dispatched in delivery order. No
/// ordering holds across shards.
#[derive(Clone)]
pub struct EventPipeline {
    registry: Arc<EventRegistry>,
}

impl EventPipeline {
    /// Creates a pipeline over a shared registry.
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Dispatches one envelope: cache stage, then business stage.
    ///
    /// Unknown event types are dropped silently: forward compatibility with
    /// upstream event additions is required, so they are never an error.
    pub async fn dispatch(&self, envelope: EventEnvelope) {
        let Some(stages) = self.registry.get(&envelope.event_type) else {
            trace!(event_type = %envelope.event_type, "No handler registered, dropping event");
            return;
        };

        if let Some(cache_stage) = &stages.cache_stage
            && let Err(e) = cache_stage(envelope.payload.clone()).await
        {
            warn!(
                event_type = %envelope.event_type,
                error = %e,
                "Cache stage failed"
            );
        }

        if let Some(business_stage) = &stages.business_stage
            && let Err(e) = business_stage(envelope.payload.clone()).await
        {
            warn!(
                event_type = %envelope.event_type,
                error = %e,
                "Business stage failed"
            );
        }
    }

    /// Consumes a shard's envelope channel until it closes.
    pub async fn run(self, mut events: mpsc::Receiver<EventEnvelope>) {
        while let Some(envelope) = events.recv().await {
            self.dispatch(envelope).await;
        }
        trace!("Event channel closed, pipeline task exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording_stage(log: Arc<Mutex<Vec<String>>>, label: &'static str) -> EventStages {
        EventStages::new().business(move |payload| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{label}:{payload}"));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn unknown_event_types_are_dropped_silently() {
        let pipeline = EventPipeline::new(Arc::new(EventRegistry::new()));
        // Must not panic or error.
        pipeline
            .dispatch(EventEnvelope::new("UNKNOWN_TYPE", Some(1), json!({})))
            .await;
    }

    #[tokio::test]
    async fn cache_stage_runs_before_business_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EventRegistry::new());

        let cache_log = Arc::clone(&log);
        let business_log = Arc::clone(&log);
        registry.register(
            "MESSAGE_CREATE",
            EventStages::new()
                .cache(move |_| {
                    let log = Arc::clone(&cache_log);
                    async move {
                        log.lock().push("cache".to_string());
                        Ok(())
                    }
                })
                .business(move |_| {
                    let log = Arc::clone(&business_log);
                    async move {
                        log.lock().push("business".to_string());
                        Ok(())
                    }
                }),
        );

        let pipeline = EventPipeline::new(registry);
        pipeline
            .dispatch(EventEnvelope::new("MESSAGE_CREATE", Some(1), json!({})))
            .await;

        assert_eq!(*log.lock(), vec!["cache", "business"]);
    }

    #[tokio::test]
    async fn cache_failure_does_not_suppress_business_or_other_types() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EventRegistry::new());

        let business_log = Arc::clone(&log);
        registry.register(
            "TYPE_A",
            EventStages::new()
                .cache(|_| async { Err(HandlerError::from("cache store unavailable")) })
                .business(move |_| {
                    let log = Arc::clone(&business_log);
                    async move {
                        log.lock().push("a-business".to_string());
                        Ok(())
                    }
                }),
        );

        let other_log = Arc::clone(&log);
        registry.register(
            "TYPE_B",
            EventStages::new().business(move |_| {
                let log = Arc::clone(&other_log);
                async move {
                    log.lock().push("b-business".to_string());
                    Ok(())
                }
            }),
        );

        let pipeline = EventPipeline::new(registry);
        pipeline
            .dispatch(EventEnvelope::new("TYPE_A", Some(1), json!({})))
            .await;
        pipeline
            .dispatch(EventEnvelope::new("TYPE_B", Some(2), json!({})))
            .await;

        assert_eq!(*log.lock(), vec!["a-business", "b-business"]);
    }

    #[tokio::test]
    async fn envelopes_dispatch_in_delivery_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EventRegistry::new());
        registry.register("ORDERED", recording_stage(Arc::clone(&log), "seen"));

        let (tx, rx) = mpsc::channel(16);
        let pipeline = EventPipeline::new(registry);
        let task = tokio::spawn(pipeline.run(rx));

        for i in 0..10 {
            tx.send(EventEnvelope::new("ORDERED", Some(i), json!(i)))
                .await
                .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let seen: Vec<String> = log.lock().clone();
        let expected: Vec<String> = (0..10).map(|i| format!("seen:{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn registration_replaces_previous_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(EventRegistry::new());
        registry.register("TYPE", recording_stage(Arc::clone(&log), "first"));
        registry.register("TYPE", recording_stage(Arc::clone(&log), "second"));

        let pipeline = EventPipeline::new(registry);
        pipeline
            .dispatch(EventEnvelope::new("TYPE", None, json!(null)))
            .await;

        assert_eq!(*log.lock(), vec!["second:null"]);
    }
}
