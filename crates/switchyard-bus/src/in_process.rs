//! In-process message bus: one queue, one dispatcher task, no network hop

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use switchyard_core::{BusBackend, BusMetrics, Error, Inbox, Message, MessageBus, Result};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deliver::{Counters, deliver_local};

/// Message bus for agents living in the same process.
///
/// Every publish goes through a single FIFO queue drained by one dispatcher
/// task, so messages for the same receiver arrive in publish order.
pub struct InProcessBus {
    subscribers: Arc<RwLock<HashMap<String, Inbox>>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl InProcessBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        info!("Created in-process message bus");
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            queue_tx: Mutex::new(Some(tx)),
            queue_rx: Mutex::new(Some(rx)),
            dispatcher: tokio::sync::Mutex::new(None),
            counters: Arc::new(Counters::default()),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Wait until every queued message has been dispatched
    pub async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Whether `subscriber_id` currently has an inbox
    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.subscribers.read().contains_key(subscriber_id)
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn start(&self) -> Result<()> {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            warn!("In-process bus already started");
            return Ok(());
        };

        let subscribers = self.subscribers.clone();
        let counters = self.counters.clone();
        let pending = self.pending.clone();
        let idle = self.idle.clone();

        let handle = tokio::spawn(async move {
            // Ends once the sender is dropped and the queue is empty
            while let Some(message) = rx.recv().await {
                deliver_local(&subscribers, &counters, &message);
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    idle.notify_waiters();
                }
            }
            debug!("In-process dispatcher drained");
        });

        *self.dispatcher.lock().await = Some(handle);
        info!("In-process message bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Dropping the only sender lets the dispatcher drain what is queued
        drop(self.queue_tx.lock().take());

        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("In-process dispatcher ended abnormally: {}", e);
            }
        } else if let Some(mut rx) = self.queue_rx.lock().take() {
            // Never started: whatever was queued is dropped
            let mut dropped = 0;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!("In-process bus stopped before start, dropping {} messages", dropped);
                self.counters.dropped.fetch_add(dropped, Ordering::Relaxed);
            }
            self.pending.store(0, Ordering::SeqCst);
            self.idle.notify_waiters();
        }

        self.subscribers.write().clear();
        info!("In-process message bus stopped");
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        let guard = self.queue_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Bus("in-process bus is stopped".to_string()))?;

        debug!(
            "Publishing {} message {} from '{}' to '{}'",
            message.message_type, message.id, message.sender_id, message.receiver_id
        );
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Bus("in-process dispatcher has shut down".to_string()));
        }
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, subscriber_id: &str, inbox: Inbox) -> Result<()> {
        let replaced = self
            .subscribers
            .write()
            .insert(subscriber_id.to_string(), inbox)
            .is_some();
        if replaced {
            info!("Subscriber '{}' replaced its inbox", subscriber_id);
        } else {
            info!("Subscriber '{}' joined the bus", subscriber_id);
        }
        Ok(())
    }

    async fn unsubscribe(&self, subscriber_id: &str) -> Result<()> {
        if self.subscribers.write().remove(subscriber_id).is_some() {
            info!("Subscriber '{}' left the bus", subscriber_id);
        }
        Ok(())
    }

    fn metrics(&self) -> BusMetrics {
        BusMetrics {
            backend: BusBackend::InProcess,
            messages_published: self.counters.published.load(Ordering::Relaxed),
            messages_delivered: self.counters.delivered.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().len(),
            queue_size: Some(self.pending.load(Ordering::SeqCst)),
            broker_errors: None,
        }
    }

    fn backend(&self) -> BusBackend {
        BusBackend::InProcess
    }
}
