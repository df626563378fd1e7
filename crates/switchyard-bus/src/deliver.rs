//! Local fan-out shared by both backends

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use switchyard_core::{Error, Inbox, Message};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub broker_errors: AtomicU64,
}

/// Hand `message` to the matching local inboxes without ever blocking.
///
/// Direct messages go to the inbox registered under `receiver_id`; broadcasts
/// go to every inbox except the sender's. Anything that cannot be handed over
/// is counted as dropped and logged as a delivery failure.
pub(crate) fn deliver_local(
    subscribers: &RwLock<HashMap<String, Inbox>>,
    counters: &Counters,
    message: &Message,
) {
    let targets: Vec<(String, Inbox)> = {
        let subs = subscribers.read();
        if message.is_broadcast() {
            subs.iter()
                .filter(|(id, _)| **id != message.sender_id)
                .map(|(id, inbox)| (id.clone(), inbox.clone()))
                .collect()
        } else {
            subs.get(&message.receiver_id)
                .map(|inbox| vec![(message.receiver_id.clone(), inbox.clone())])
                .unwrap_or_default()
        }
    };

    if targets.is_empty() {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        if !message.is_broadcast() {
            let failure = Error::DeliveryFailure(message.receiver_id.clone());
            warn!("{} (message {} from '{}')", failure, message.id, message.sender_id);
        } else {
            debug!("Broadcast {} from '{}' had no listeners", message.id, message.sender_id);
        }
        return;
    }

    for (id, inbox) in targets {
        match inbox.try_send(message.clone()) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Inbox of '{}' is full, dropping message {}", id, message.id);
            }
            Err(TrySendError::Closed(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Inbox of '{}' is closed, dropping message {}", id, message.id);
            }
        }
    }
}
