//! Event bus: per-instance typed pub/sub, the basis for
//! observability across the pipeline.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Event names emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    RequestAllowed,
    RequestBlocked,
    CacheHit,
    CacheMiss,
    CacheStore,
    ContextTrimmed,
    RouterDowngraded,
    LedgerEntry,
    BreakerWarning,
    BreakerTripped,
    UserBudgetWarning,
    UserBudgetExceeded,
    UserBudgetSpend,
    StorageError,
}

/// An emitted event: a name plus an arbitrary JSON payload, matching the
/// `emit(event, payload)` shape handlers subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    pub payload: Value,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    name: EventName,
    handler: Handler,
}

/// Synchronous, in-process, per-instance typed pub/sub.
///
/// Delivery is synchronous, in subscription order, on the emitter's task.
/// A panicking handler is caught so it never interrupts delivery to
/// subsequent subscribers or propagates to the emitter.
pub struct EventBus {
    subs: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    forward_global: bool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_BUS: OnceLock<EventBus> = OnceLock::new();

impl EventBus {
    pub fn new() -> Self {
        Self {
            subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            forward_global: false,
        }
    }

    /// Like [`Self::new`], but every emitted event is also forwarded to the
    /// process-wide bus (see [`Self::global`]) after local delivery. Off by
    /// default: most instances share no state, per the single-instance
    /// ownership model, and aggregating across instances is opt-in.
    pub fn with_global_forwarding() -> Self {
        Self {
            forward_global: true,
            ..Self::new()
        }
    }

    /// The process-wide bus shared by every instance that opts into
    /// [`Self::with_global_forwarding`]. Lazily initialized on first use;
    /// observers subscribe here to aggregate events across instances.
    pub fn global() -> &'static EventBus {
        GLOBAL_BUS.get_or_init(EventBus::new)
    }

    /// Subscribe to `name`. Returns a subscription id; pass it to
    /// [`Self::unsubscribe_id`] to detach the handler (a plain id rather
    /// than a borrowed closure avoids tying the subscriber to the bus's
    /// lifetime).
    pub async fn on<F>(&self, name: EventName, handler: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subs.write().await.push(Subscription {
            id,
            name,
            handler: Arc::new(handler),
        });
        id
    }

    pub async fn unsubscribe_id(&self, id: u64) {
        self.subs.write().await.retain(|s| s.id != id);
    }

    /// Emit `name` with `payload`, delivered synchronously in subscription
    /// order. Handler panics are isolated and never reach the caller. If
    /// this bus was constructed with [`Self::with_global_forwarding`], the
    /// event is also delivered to [`Self::global`]'s subscribers.
    pub async fn emit(&self, name: EventName, payload: Value) {
        let event = Event { name, payload };
        self.deliver(&event).await;
        if self.forward_global && !std::ptr::eq(self, EventBus::global()) {
            EventBus::global().deliver(&event).await;
        }
    }

    async fn deliver(&self, event: &Event) {
        let handlers: Vec<Handler> = self
            .subs
            .read()
            .await
            .iter()
            .filter(|s| s.name == event.name)
            .map(|s| s.handler.clone())
            .collect();
        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(event)));
            if result.is_err() {
                tracing::warn!(name = ?event.name, "event handler panicked; isolated");
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        bus.on(EventName::CacheHit, move |_| {
            o1.try_lock().unwrap().push(1);
        })
        .await;
        let o2 = order.clone();
        bus.on(EventName::CacheHit, move |_| {
            o2.try_lock().unwrap().push(2);
        })
        .await;
        bus.emit(EventName::CacheHit, json!({})).await;
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        bus.on(EventName::CacheMiss, |_| panic!("boom")).await;
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        bus.on(EventName::CacheMiss, move |_| {
            hit2.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        bus.emit(EventName::CacheMiss, json!({})).await;
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn global_forwarding_reaches_process_wide_subscribers() {
        let probe_id = {
            let hit = Arc::new(AtomicUsize::new(0));
            let hit2 = hit.clone();
            let id = EventBus::global()
                .on(EventName::BreakerTripped, move |_| {
                    hit2.fetch_add(1, Ordering::SeqCst);
                })
                .await;

            let instance = EventBus::with_global_forwarding();
            instance.emit(EventName::BreakerTripped, json!({})).await;
            assert_eq!(hit.load(Ordering::SeqCst), 1);
            id
        };
        EventBus::global().unsubscribe_id(probe_id).await;
    }

    #[tokio::test]
    async fn without_forwarding_global_bus_is_untouched() {
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let id = EventBus::global()
            .on(EventName::UserBudgetSpend, move |_| {
                hit2.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        let instance = EventBus::new();
        instance.emit(EventName::UserBudgetSpend, json!({})).await;
        assert_eq!(hit.load(Ordering::SeqCst), 0);
        EventBus::global().unsubscribe_id(id).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus
            .on(EventName::CacheStore, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        bus.unsubscribe_id(id).await;
        bus.emit(EventName::CacheStore, json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}


