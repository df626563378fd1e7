//! Standalone TCP broker backing the distributed bus
//!
//! Clients speak newline-delimited JSON [`Frame`]s. A connection subscribes to
//! topics (agent ids plus the shared broadcast topic) and receives a `Deliver`
//! frame for every `Publish` on those topics. Ordering is FIFO per connection
//! only; there is no ordering across connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::frame::{Frame, MAX_FRAME_BYTES};

type ConnId = u64;

#[derive(Default)]
struct BrokerState {
    topics: RwLock<HashMap<String, HashMap<ConnId, mpsc::UnboundedSender<Frame>>>>,
    next_conn: AtomicU64,
    connections: AtomicUsize,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BrokerState {
    fn apply(&self, conn: ConnId, outbound: &mpsc::UnboundedSender<Frame>, frame: Frame) {
        match frame {
            Frame::Subscribe { topic } => {
                debug!("Connection {} subscribed to '{}'", conn, topic);
                self.topics
                    .write()
                    .entry(topic)
                    .or_default()
                    .insert(conn, outbound.clone());
            }
            Frame::Unsubscribe { topic } => {
                debug!("Connection {} unsubscribed from '{}'", conn, topic);
                let mut topics = self.topics.write();
                if let Some(subs) = topics.get_mut(&topic) {
                    subs.remove(&conn);
                    if subs.is_empty() {
                        topics.remove(&topic);
                    }
                }
            }
            Frame::Publish { topic, message } => {
                self.published.fetch_add(1, Ordering::Relaxed);
                let targets: Vec<mpsc::UnboundedSender<Frame>> = self
                    .topics
                    .read()
                    .get(&topic)
                    .map(|subs| subs.values().cloned().collect())
                    .unwrap_or_default();

                if targets.is_empty() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "No subscriber for topic '{}', dropping message {}",
                        topic, message.id
                    );
                    return;
                }

                for target in targets {
                    let frame = Frame::Deliver {
                        topic: topic.clone(),
                        message: message.clone(),
                    };
                    if target.send(frame).is_ok() {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Frame::Deliver { .. } => {
                warn!("Connection {} sent a deliver frame, ignoring", conn);
            }
        }
    }

    fn remove_connection(&self, conn: ConnId) {
        let mut topics = self.topics.write();
        topics.retain(|_, subs| {
            subs.remove(&conn);
            !subs.is_empty()
        });
    }
}

/// Point-in-time broker counters
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BrokerStats {
    pub connections: usize,
    pub topics: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

/// Cheap handle for inspecting a running broker
#[derive(Clone)]
pub struct BrokerHandle {
    state: Arc<BrokerState>,
}

impl BrokerHandle {
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.state.connections.load(Ordering::Relaxed),
            topics: self.state.topics.read().len(),
            published: self.state.published.load(Ordering::Relaxed),
            delivered: self.state.delivered.load(Ordering::Relaxed),
            dropped: self.state.dropped.load(Ordering::Relaxed),
        }
    }

    /// Number of connections subscribed to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state.topics.read().get(topic).map_or(0, |subs| subs.len())
    }
}

/// The broker server
pub struct Broker {
    listener: TcpListener,
    state: Arc<BrokerState>,
}

impl Broker {
    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind broker on {}", addr))?;
        Ok(Self {
            listener,
            state: Arc::new(BrokerState::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            state: self.state.clone(),
        }
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("Broker listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Broker shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = self.state.clone();
                            let cancel = cancel.child_token();
                            tokio::spawn(async move {
                                handle_connection(stream, peer, state, cancel).await;
                            });
                        }
                        Err(e) => warn!("Broker accept failed: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the broker in the background, returning a handle
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<BrokerState>,
    cancel: CancellationToken,
) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    state.connections.fetch_add(1, Ordering::Relaxed);
    info!("Broker connection {} from {}", conn, peer);

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let (mut sink, mut lines) = framed.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let line = match frame.encode() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                warn!("Broker write to connection {} failed: {}", conn, e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next() => match next {
                Some(Ok(line)) => match Frame::decode(&line) {
                    Ok(frame) => state.apply(conn, &outbound, frame),
                    Err(e) => warn!("Malformed frame from connection {}: {}", conn, e),
                },
                Some(Err(e)) => {
                    warn!("Broker read from connection {} failed: {}", conn, e);
                    break;
                }
                None => break,
            }
        }
    }

    state.remove_connection(conn);
    drop(outbound);
    if let Err(e) = writer.await {
        warn!("Broker writer for connection {} ended abnormally: {}", conn, e);
    }
    state.connections.fetch_sub(1, Ordering::Relaxed);
    info!("Broker connection {} closed", conn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::{Message, MessageType};

    #[test]
    fn test_publish_without_subscribers_is_dropped() {
        let state = BrokerState::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let message = Message::new("nobody", MessageType::Query, json!({}));
        state.apply(
            1,
            &tx,
            Frame::Publish {
                topic: "nobody".to_string(),
                message,
            },
        );
        assert_eq!(state.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(state.delivered.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_fan_out_to_every_subscribed_connection() {
        let state = BrokerState::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        state.apply(1, &tx1, Frame::Subscribe { topic: "broadcast".into() });
        state.apply(2, &tx2, Frame::Subscribe { topic: "broadcast".into() });

        let message = Message::broadcast(MessageType::Heartbeat, json!({}));
        state.apply(
            3,
            &tx1,
            Frame::Publish {
                topic: "broadcast".into(),
                message,
            },
        );

        assert!(matches!(rx1.try_recv(), Ok(Frame::Deliver { .. })));
        assert!(matches!(rx2.try_recv(), Ok(Frame::Deliver { .. })));
        assert_eq!(state.delivered.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_remove_connection_prunes_topics() {
        let state = BrokerState::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.apply(1, &tx, Frame::Subscribe { topic: "a".into() });
        state.apply(1, &tx, Frame::Subscribe { topic: "b".into() });
        assert_eq!(state.topics.read().len(), 2);
        state.remove_connection(1);
        assert!(state.topics.read().is_empty());
    }
}
