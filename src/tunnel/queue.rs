//! Bounded multi-producer/multi-consumer queue with a fuse.
//!
//! Every enqueue in the engine goes through [`QueueSender::push`], which waits
//! at most the configured timeout for space. When the queue stays full the
//! item is dropped and a `tunnel_queue_fuse_total{endpoint,queue}` counter is
//! bumped;
//! producers (above all the socket reader) never block indefinitely.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::QueueConfig;
use crate::observe::{names, Observer};

/// Why an item was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Still full after the timeout. The item was dropped.
    Fused,
    /// All receivers are gone (connection closing).
    Closed,
}

pub struct QueueSender<T> {
    endpoint: Arc<str>,
    name: &'static str,
    tx: async_channel::Sender<T>,
    timeout: Duration,
    observer: Arc<dyn Observer>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: Arc::clone(&self.endpoint),
            name: self.name,
            tx: self.tx.clone(),
            timeout: self.timeout,
            observer: Arc::clone(&self.observer),
        }
    }
}

pub struct QueueReceiver<T> {
    name: &'static str,
    rx: async_channel::Receiver<T>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            rx: self.rx.clone(),
        }
    }
}

/// Create a bounded queue named `name` on the connection to `endpoint`.
pub fn bounded<T>(
    endpoint: &str,
    name: &'static str,
    config: QueueConfig,
    observer: Arc<dyn Observer>,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = async_channel::bounded(config.capacity.max(1));
    (
        QueueSender {
            endpoint: Arc::from(endpoint),
            name,
            tx,
            timeout: config.timeout(),
            observer,
        },
        QueueReceiver { name, rx },
    )
}

impl<T> QueueSender<T> {
    /// Enqueue, waiting at most the configured timeout for space.
    pub async fn push(&self, item: T) -> Result<(), PushError> {
        match tokio::time::timeout(self.timeout, self.tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PushError::Closed),
            Err(_) => {
                warn!(
                    endpoint = %self.endpoint,
                    queue = self.name,
                    "Tunnel: queue full, dropping message"
                );
                self.observer.inc_counter(
                    names::QUEUE_FUSE,
                    &[("endpoint", &*self.endpoint), ("queue", self.name)],
                );
                Err(PushError::Fused)
            }
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Next item, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
