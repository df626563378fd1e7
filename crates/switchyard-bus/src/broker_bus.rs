//! Distributed message bus backed by the TCP [`Broker`](crate::broker::Broker)

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use switchyard_core::{BusBackend, BusMetrics, Error, Inbox, Message, MessageBus, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deliver::{Counters, deliver_local};
use crate::frame::{BROADCAST_TOPIC, Frame, MAX_FRAME_BYTES, topic_for};

/// Message bus whose subscribers may live in other processes.
///
/// Local subscribers are registered with the broker under their id; the
/// broker fans each publish out to every connection subscribed to the topic,
/// and this client hands it to the local inbox. Only per-connection ordering
/// is guaranteed. Once the connection is lost every publish fails with
/// [`Error::Bus`] until the bus is started again.
pub struct BrokerBus {
    addr: String,
    subscribers: Arc<RwLock<HashMap<String, Inbox>>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reader: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl BrokerBus {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            outbound: Arc::new(Mutex::new(None)),
            writer: tokio::sync::Mutex::new(None),
            reader: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let guard = self.outbound.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Bus(format!("not connected to broker at {}", self.addr)))?;
        tx.send(frame).map_err(|_| {
            self.counters.broker_errors.fetch_add(1, Ordering::Relaxed);
            Error::Bus(format!("connection to broker at {} is closed", self.addr))
        })
    }
}

#[async_trait]
impl MessageBus for BrokerBus {
    async fn start(&self) -> Result<()> {
        if self.is_connected() {
            warn!("Broker bus already connected to {}", self.addr);
            return Ok(());
        }

        let stream = TcpStream::connect(self.addr.as_str()).await.map_err(|e| {
            self.counters.broker_errors.fetch_add(1, Ordering::Relaxed);
            Error::Bus(format!("failed to connect to broker at {}: {}", self.addr, e))
        })?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (mut sink, mut lines) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        // Installed before the tasks start so a reader that exits at once can clear it
        *self.outbound.lock() = Some(tx);

        let counters = self.counters.clone();
        let outbound = self.outbound.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let line = match frame.encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    counters.broker_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Broker write failed: {}", e);
                    outbound.lock().take();
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!("Broker connection close failed: {}", e);
            }
        });

        let subscribers = self.subscribers.clone();
        let counters = self.counters.clone();
        let cancel = self.cancel.clone();
        let outbound = self.outbound.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = lines.next() => match next {
                        Some(Ok(line)) => match Frame::decode(&line) {
                            Ok(Frame::Deliver { message, .. }) => {
                                deliver_local(&subscribers, &counters, &message);
                            }
                            Ok(other) => debug!("Ignoring unexpected frame from broker: {:?}", other),
                            Err(e) => {
                                counters.broker_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Malformed frame from broker: {}", e);
                            }
                        },
                        Some(Err(e)) => {
                            counters.broker_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("Broker read failed: {}", e);
                            break;
                        }
                        None => {
                            warn!("Broker closed the connection");
                            counters.broker_errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }
            // Lost connection: later publishes fail instead of vanishing
            outbound.lock().take();
        });

        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);

        // Subscriptions made before the connection existed
        let ids: Vec<String> = self.subscribers.read().keys().cloned().collect();
        if !ids.is_empty() {
            self.send_frame(Frame::Subscribe {
                topic: BROADCAST_TOPIC.to_string(),
            })?;
        }
        for id in ids {
            self.send_frame(Frame::Subscribe { topic: id })?;
        }

        info!("Broker bus connected to {}", self.addr);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Closing the outbound queue lets the writer flush what was published
        drop(self.outbound.lock().take());
        if let Some(writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.await {
                warn!("Broker writer ended abnormally: {}", e);
            }
        }

        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().await.take() {
            if let Err(e) = reader.await {
                warn!("Broker reader ended abnormally: {}", e);
            }
        }

        self.subscribers.write().clear();
        info!("Broker bus disconnected from {}", self.addr);
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        let topic = topic_for(&message).to_string();
        debug!(
            "Publishing {} message {} to broker topic '{}'",
            message.message_type, message.id, topic
        );
        self.send_frame(Frame::Publish { topic, message })?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, subscriber_id: &str, inbox: Inbox) -> Result<()> {
        let first = {
            let mut subs = self.subscribers.write();
            let first = subs.is_empty();
            subs.insert(subscriber_id.to_string(), inbox);
            first
        };

        if self.is_connected() {
            if first {
                self.send_frame(Frame::Subscribe {
                    topic: BROADCAST_TOPIC.to_string(),
                })?;
            }
            self.send_frame(Frame::Subscribe {
                topic: subscriber_id.to_string(),
            })?;
        }
        info!("Subscriber '{}' registered with broker bus", subscriber_id);
        Ok(())
    }

    async fn unsubscribe(&self, subscriber_id: &str) -> Result<()> {
        if self.subscribers.write().remove(subscriber_id).is_none() {
            return Ok(());
        }
        if self.is_connected() {
            self.send_frame(Frame::Unsubscribe {
                topic: subscriber_id.to_string(),
            })?;
        }
        info!("Subscriber '{}' left broker bus", subscriber_id);
        Ok(())
    }

    fn metrics(&self) -> BusMetrics {
        BusMetrics {
            backend: BusBackend::Broker,
            messages_published: self.counters.published.load(Ordering::Relaxed),
            messages_delivered: self.counters.delivered.load(Ordering::Relaxed),
            messages_dropped: self.counters.dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscribers.read().len(),
            queue_size: None,
            broker_errors: Some(self.counters.broker_errors.load(Ordering::Relaxed)),
        }
    }

    fn backend(&self) -> BusBackend {
        BusBackend::Broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerHandle};
    use serde_json::json;
    use std::time::Duration;
    use switchyard_core::MessageType;

    async fn spawn_broker() -> (String, BrokerHandle, CancellationToken) {
        let broker = Broker::bind("127.0.0.1:0").await.unwrap();
        let addr = broker.local_addr().unwrap().to_string();
        let handle = broker.handle();
        let cancel = CancellationToken::new();
        broker.spawn(cancel.clone());
        (addr, handle, cancel)
    }

    async fn wait_for_subscribers(handle: &BrokerHandle, topic: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.subscriber_count(topic) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription never reached broker");
    }

    #[tokio::test]
    async fn test_publish_before_start_is_transport_error() {
        let bus = BrokerBus::new("127.0.0.1:1");
        let err = bus
            .publish(Message::new("x", MessageType::Query, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bus(_)));
    }

    #[tokio::test]
    async fn test_direct_message_between_processes() {
        let (addr, handle, cancel) = spawn_broker().await;

        let bus_a = BrokerBus::new(addr.clone());
        let bus_b = BrokerBus::new(addr);
        bus_a.start().await.unwrap();
        bus_b.start().await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        bus_a.subscribe("expert", tx).await.unwrap();
        wait_for_subscribers(&handle, "expert", 1).await;

        let mut msg = Message::new("expert", MessageType::Query, json!({"query": "hi"}));
        msg.sender_id = "router".to_string();
        bus_b.publish(msg.clone()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, msg.id);
        assert_eq!(got.payload_str("query"), Some("hi"));
        assert_eq!(bus_a.metrics().messages_delivered, 1);
        assert_eq!(bus_b.metrics().messages_published, 1);

        bus_a.stop().await.unwrap();
        bus_b.stop().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_remote_but_not_sender() {
        let (addr, handle, cancel) = spawn_broker().await;

        let bus_a = BrokerBus::new(addr.clone());
        let bus_b = BrokerBus::new(addr);
        bus_a.start().await.unwrap();
        bus_b.start().await.unwrap();

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        bus_a.subscribe("a", tx_a).await.unwrap();
        bus_b.subscribe("b", tx_b).await.unwrap();
        wait_for_subscribers(&handle, BROADCAST_TOPIC, 2).await;

        let mut msg = Message::broadcast(MessageType::Heartbeat, json!({"status": "ready"}));
        msg.sender_id = "a".to_string();
        bus_a.publish(msg).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_id, "a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_a.try_recv().is_err());

        bus_a.stop().await.unwrap();
        bus_b.stop().await.unwrap();
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_publish_after_broker_shutdown_is_transport_error() {
        let (addr, _handle, cancel) = spawn_broker().await;
        let bus = BrokerBus::new(addr);
        bus.start().await.unwrap();
        assert!(bus.is_connected());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lost connection never noticed");

        let err = bus
            .publish(Message::new("expert", MessageType::Query, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bus(_)));
        assert!(bus.metrics().broker_errors.unwrap() >= 1);
        assert_eq!(bus.metrics().messages_published, 0);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let bus = BrokerBus::new("127.0.0.1:1");
        assert!(bus.start().await.is_err());
        assert_eq!(bus.metrics().broker_errors, Some(1));
    }
}
