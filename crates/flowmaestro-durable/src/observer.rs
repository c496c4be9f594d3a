//! Engine lifecycle event publication
//!
//! The engine announces lifecycle transitions through an [`EngineObserver`].
//! Delivery is fire-and-forget from the engine's perspective: observers must
//! never block, which is what lets the fan-out drop events for slow
//! subscribers instead of back-pressuring execution.

use serde_json::Value;
use uuid::Uuid;

/// One published lifecycle event.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub execution_id: Uuid,

    /// Owning user; subscribers only see events for their own executions.
    pub user_id: Uuid,

    /// Dotted event name (`execution.started`, `node.completed`, …).
    pub name: String,

    pub data: Value,
}

impl EngineEvent {
    pub fn new(
        execution_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            execution_id,
            user_id,
            name: name.into(),
            data,
        }
    }
}

pub trait EngineObserver: Send + Sync + 'static {
    fn publish(&self, event: EngineEvent);
}

/// Ignores everything.
#[derive(Default)]
pub struct NullObserver;

impl EngineObserver for NullObserver {
    fn publish(&self, _event: EngineEvent) {}
}

/// Fans one publication out to several observers in registration order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<std::sync::Arc<dyn EngineObserver>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, observer: std::sync::Arc<dyn EngineObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl EngineObserver for CompositeObserver {
    fn publish(&self, event: EngineEvent) {
        for observer in &self.observers {
            observer.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(AtomicUsize);

    impl EngineObserver for Counting {
        fn publish(&self, _event: EngineEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_composite_forwards_to_all() {
        let a = Arc::new(Counting(AtomicUsize::new(0)));
        let b = Arc::new(Counting(AtomicUsize::new(0)));
        let composite = CompositeObserver::new()
            .push(a.clone())
            .push(b.clone());

        composite.publish(EngineEvent::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "node.started",
            serde_json::json!({}),
        ));

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }
}
