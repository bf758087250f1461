//! Typed publish/subscribe with explicit listener lifecycle.
//!
//! Each [`Subscription`] owns the receiving end of its own channel.  Dropping
//! it (or calling [`Subscription::unsubscribe`]) disposes of the listener; the
//! publisher notices the closed channel on its next [`Subscribers::publish`]
//! and forgets it, so listeners never pile up across reconnects.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Fan-out registry owned by a session.
pub struct Subscribers<E> {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.  Events published from now on are delivered in order.
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.senders).push(tx);
        Subscription { rx }
    }

    /// Deliver `event` to every live listener and drop the disposed ones.
    pub fn publish(&self, event: E) {
        lock(&self.senders).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Forget every listener.  Their subscriptions yield `None` once drained.
    pub fn close(&self) {
        lock(&self.senders).clear();
    }

    /// Number of registered listeners, including ones disposed since the last
    /// publish.
    pub fn len(&self) -> usize {
        lock(&self.senders).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.  Every mutex
/// in this crate guards plain data that is never left half-updated.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Receiving half handed to a consumer.  Drop it to unsubscribe.
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Wait for the next event.  `None` once the publishing session is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Non-blocking poll, for render loops.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Explicit disposer.  Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}
