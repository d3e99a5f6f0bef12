// ── Event fan-out ──
//
// Controllers enqueue events while they still hold their state lock, so
// the queue order is the transition order. A single dispatcher task drains
// the queue and invokes observers with no controller lock held.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::model::{ConnectFailureKind, ConnectionEvent, ConnectionState, DeviceIdentity, TimeoutKind};

// ── Observer ─────────────────────────────────────────────────────────

/// Receiver of connection events.
///
/// Override [`on_event`](Self::on_event) to see everything, or any of the
/// per-variant hooks. Plain closures taking `&ConnectionEvent` qualify.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged { identity, state } => {
                self.on_state_changed(identity, *state);
            }
            ConnectionEvent::ConnectFailed { identity, reason } => {
                self.on_connect_failed(identity, reason);
            }
            ConnectionEvent::ConnectTimeout { identity, kind } => {
                self.on_connect_timeout(identity, *kind);
            }
        }
    }

    fn on_state_changed(&self, _identity: &DeviceIdentity, _state: ConnectionState) {}

    fn on_connect_failed(&self, _identity: &DeviceIdentity, _reason: &ConnectFailureKind) {}

    fn on_connect_timeout(&self, _identity: &DeviceIdentity, _kind: TimeoutKind) {}
}

impl<F> ConnectionObserver for F
where
    F: Fn(&ConnectionEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ConnectionEvent) {
        self(event);
    }
}

struct ChannelObserver(mpsc::UnboundedSender<ConnectionEvent>);

impl ConnectionObserver for ChannelObserver {
    fn on_event(&self, event: &ConnectionEvent) {
        // Receiver dropped without unsubscribing: nothing left to deliver to.
        let _ = self.0.send(event.clone());
    }
}

/// Token returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

// ── EventNotifier ────────────────────────────────────────────────────

/// Publish/subscribe hub shared by every controller of a registry.
///
/// Cheaply cloneable. Subscriptions are independent of any controller:
/// an observer registered before the first `connect` sees every device.
#[derive(Clone)]
pub struct EventNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    subscribers: Arc<DashMap<SubscriptionHandle, Arc<dyn ConnectionObserver>>>,
    queue: mpsc::UnboundedSender<ConnectionEvent>,
    next_id: AtomicU64,
}

impl EventNotifier {
    /// Create a notifier and spawn its dispatcher task.
    ///
    /// Must be called from within a Tokio runtime. The dispatcher exits
    /// once the last clone of this notifier is dropped.
    pub fn new() -> Self {
        let subscribers = Arc::new(DashMap::new());
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx, Arc::clone(&subscribers)));

        Self {
            inner: Arc::new(NotifierInner {
                subscribers,
                queue,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, observer: impl ConnectionObserver) -> SubscriptionHandle {
        self.subscribe_arc(Arc::new(observer))
    }

    pub fn subscribe_arc(&self, observer: Arc<dyn ConnectionObserver>) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.insert(handle, observer);
        debug!(subscription = handle.0, "observer subscribed");
        handle
    }

    /// Subscribe with an unbounded channel instead of a callback.
    ///
    /// The receiver yields `None` once the subscription is removed.
    pub fn subscribe_channel(&self) -> (SubscriptionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(ChannelObserver(tx)), rx)
    }

    /// Remove a subscription. Unknown or already-removed handles are ignored.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.inner.subscribers.remove(&handle).is_some() {
            debug!(subscription = handle.0, "observer unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Queue an event for delivery to every subscriber. Never blocks.
    pub fn publish(&self, event: ConnectionEvent) {
        if self.inner.queue.send(event).is_err() {
            debug!("event dispatcher is gone; dropping event");
        }
    }
}

impl Default for EventNotifier {
    /// Same as [`new`](Self::new): spawns the dispatcher, so it panics
    /// outside a Tokio runtime.
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    subscribers: Arc<DashMap<SubscriptionHandle, Arc<dyn ConnectionObserver>>>,
) {
    while let Some(event) = rx.recv().await {
        // Snapshot first: observers may (un)subscribe while being notified.
        let snapshot: Vec<(SubscriptionHandle, Arc<dyn ConnectionObserver>)> = subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        trace!(
            address = %event.identity().address,
            observers = snapshot.len(),
            "dispatching event"
        );
        for (handle, observer) in snapshot {
            // A panicking observer must not take the other subscribers down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                warn!(
                    subscription = handle.0,
                    address = %event.identity().address,
                    "observer panicked; continuing delivery"
                );
            }
        }
    }
    debug!("event dispatcher stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::parse("AA:BB:CC:DD:EE:01", "Sensor").unwrap()
    }

    fn state_event(state: ConnectionState) -> ConnectionEvent {
        ConnectionEvent::StateChanged {
            identity: identity(),
            state,
        }
    }

    #[tokio::test]
    async fn channel_subscriber_receives_in_publish_order() {
        let notifier = EventNotifier::new();
        let (_handle, mut rx) = notifier.subscribe_channel();

        notifier.publish(state_event(ConnectionState::Scanning));
        notifier.publish(state_event(ConnectionState::Connecting));

        assert_eq!(rx.recv().await.unwrap().state(), Some(ConnectionState::Scanning));
        assert_eq!(rx.recv().await.unwrap().state(), Some(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let notifier = EventNotifier::new();
        let (handle, mut rx) = notifier.subscribe_channel();
        notifier.unsubscribe(handle);
        notifier.unsubscribe(handle);

        assert_eq!(notifier.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[derive(Clone, Default)]
    struct TimeoutCounter(Arc<Mutex<Vec<TimeoutKind>>>);

    impl ConnectionObserver for TimeoutCounter {
        fn on_connect_timeout(&self, _identity: &DeviceIdentity, kind: TimeoutKind) {
            self.0.lock().unwrap().push(kind);
        }
    }

    #[tokio::test]
    async fn per_variant_hooks_are_routed() {
        let notifier = EventNotifier::new();
        let counter = TimeoutCounter::default();
        notifier.subscribe(counter.clone());
        let (_h, mut rx) = notifier.subscribe_channel();

        notifier.publish(state_event(ConnectionState::Scanning));
        notifier.publish(ConnectionEvent::ConnectTimeout {
            identity: identity(),
            kind: TimeoutKind::CannotConnect,
        });
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        assert_eq!(*counter.0.lock().unwrap(), vec![TimeoutKind::CannotConnect]);
    }

    #[tokio::test]
    async fn observer_may_unsubscribe_itself_during_delivery() {
        let notifier = EventNotifier::new();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::default();
        let seen = Arc::new(AtomicU64::new(0));

        let handle = {
            let notifier = notifier.clone();
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            notifier.clone().subscribe(move |_event: &ConnectionEvent| {
                seen.fetch_add(1, Ordering::SeqCst);
                if let Some(h) = slot.lock().unwrap().take() {
                    notifier.unsubscribe(h);
                }
            })
        };
        *slot.lock().unwrap() = Some(handle);
        let (_h, mut rx) = notifier.subscribe_channel();

        notifier.publish(state_event(ConnectionState::Scanning));
        notifier.publish(state_event(ConnectionState::Connecting));
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_stop_dispatch() {
        let notifier = EventNotifier::new();
        notifier.subscribe(|event: &ConnectionEvent| {
            assert_ne!(event.state(), Some(ConnectionState::Connecting), "observer bug");
        });
        let (_h, mut rx) = notifier.subscribe_channel();

        notifier.publish(state_event(ConnectionState::Connecting));
        notifier.publish(state_event(ConnectionState::Connected));

        assert_eq!(rx.recv().await.unwrap().state(), Some(ConnectionState::Connecting));
        assert_eq!(rx.recv().await.unwrap().state(), Some(ConnectionState::Connected));
        assert_eq!(notifier.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn default_notifier_dispatches_inside_runtime() {
        let notifier = EventNotifier::default();
        let (_h, mut rx) = notifier.subscribe_channel();
        notifier.publish(state_event(ConnectionState::Scanning));
        assert_eq!(rx.recv().await.unwrap().state(), Some(ConnectionState::Scanning));
    }
}
