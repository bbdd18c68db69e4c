//! Pipeline plumbing: typed fan-out queues and the root shutdown signal.
//!
//! Stages communicate exclusively through [`Queue`]s. Every subscriber
//! receives every message in FIFO order; a send blocks once the slowest
//! subscriber's buffer fills up.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::{Notify, mpsc};

static SHUTDOWN: once_cell::sync::Lazy<Arc<AtomicBool>> =
    once_cell::sync::Lazy::new(|| Arc::new(AtomicBool::new(false)));

static SHUTDOWN_NOTIFY: once_cell::sync::Lazy<Arc<Notify>> =
    once_cell::sync::Lazy::new(|| Arc::new(Notify::new()));

pub fn shutdown_flag() -> Arc<AtomicBool> {
    SHUTDOWN.clone()
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Relaxed);
    SHUTDOWN_NOTIFY.notify_waiters();
}

/// Resolves when [`request_shutdown`] is called. Safe to poll repeatedly.
pub async fn shutdown_signal() {
    if shutdown_requested() {
        return;
    }
    let notified = SHUTDOWN_NOTIFY.notified();
    if shutdown_requested() {
        return;
    }
    notified.await;
}

pub const DEFAULT_QUEUE_LEN: usize = 10;

/// Lifecycle transition carried by every queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A lifecycle event for some pipeline object.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub kind: EventKind,
    pub obj: T,
}

impl<T> Event<T> {
    pub fn created(obj: T) -> Self {
        Event {
            kind: EventKind::Created,
            obj,
        }
    }

    pub fn deleted(obj: T) -> Self {
        Event {
            kind: EventKind::Deleted,
            obj,
        }
    }
}

/// Bounded multi-subscriber queue. Cloning the queue clones the handle,
/// not the buffered messages; all clones feed the same subscriber set.
pub struct Queue<T> {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<T>>>>,
    buffer: usize,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue {
            subscribers: Arc::clone(&self.subscribers),
            buffer: self.buffer,
        }
    }
}

impl<T: Clone + Send + 'static> Queue<T> {
    pub fn new(buffer: usize) -> Self {
        Queue {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            buffer,
        }
    }

    /// Register a new subscriber. Messages sent before subscription are not
    /// replayed.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver `item` to every live subscriber, awaiting room in each buffer.
    /// Subscribers whose receiver was dropped are pruned.
    pub async fn send(&self, item: T) {
        let targets: Vec<mpsc::Sender<T>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut closed = false;
        for tx in &targets {
            if tx.send(item.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|tx| !tx.is_closed());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
