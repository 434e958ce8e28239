//! Observer registry for request lifecycle notifications
//!
//! Callbacks run on whichever worker resolves the request, outside the
//! registry lock, in subscription order. Use `subscribe_channel` to receive
//! events on another thread or task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::core::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    MeshLods,
    TextureMips,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamingEvent {
    Started { resource: ResourceId, kind: RequestKind },
    Finished { resource: ResourceId, kind: RequestKind, levels: Vec<u8> },
    Cancelled { resource: ResourceId, kind: RequestKind },
    Aborted { resource: ResourceId, kind: RequestKind, reason: String },
}

/// Returned by `subscribe`, hand back to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type Callback = Arc<dyn Fn(&StreamingEvent) + Send + Sync>;

struct Observer {
    token: ObserverToken,
    callback: Callback,
}

#[derive(Default)]
struct Observers {
    callbacks: Vec<Observer>,
    channels: Vec<mpsc::UnboundedSender<StreamingEvent>>,
}

#[derive(Default)]
pub struct StreamingEvents {
    next_token: AtomicU64,
    observers: Mutex<Observers>,
}

impl StreamingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, callback: impl Fn(&StreamingEvent) + Send + Sync + 'static) -> ObserverToken {
        let token = ObserverToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.lock().callbacks.push(Observer { token, callback: Arc::new(callback) });
        token
    }

    /// Remove a callback. Returns false for unknown or already removed tokens.
    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        let mut observers = self.lock();
        let before = observers.callbacks.len();
        observers.callbacks.retain(|o| o.token != token);
        observers.callbacks.len() != before
    }

    /// Receive events over a channel; dropping the receiver unsubscribes
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<StreamingEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().channels.push(tx);
        rx
    }

    pub fn observer_count(&self) -> usize {
        let observers = self.lock();
        observers.callbacks.len() + observers.channels.len()
    }

    pub fn emit(&self, event: StreamingEvent) {
        let callbacks: Vec<Callback> = {
            let mut observers = self.lock();
            observers.channels.retain(|tx| tx.send(event.clone()).is_ok());
            observers.callbacks.iter().map(|o| o.callback.clone()).collect()
        };
        for callback in callbacks {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(resource: ResourceId) -> StreamingEvent {
        StreamingEvent::Started { resource, kind: RequestKind::MeshLods }
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let events = StreamingEvents::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let token = events.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events.emit(started(1));
        assert!(events.unsubscribe(token));
        assert!(!events.unsubscribe(token));
        events.emit(started(2));

        assert_eq!(*seen.lock().unwrap(), vec![started(1)]);
    }

    #[test]
    fn test_callbacks_run_in_subscription_order() {
        let events = StreamingEvents::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            events.subscribe(move |_| order.lock().unwrap().push(i));
        }
        events.emit(started(1));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_channel_delivery_and_drop() {
        let events = StreamingEvents::new();
        let mut rx = events.subscribe_channel();
        events.emit(started(4));
        assert_eq!(rx.recv().await, Some(started(4)));

        drop(rx);
        events.emit(started(5));
        assert_eq!(events.observer_count(), 0);
    }
}
