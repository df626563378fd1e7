//! Peer liveness tracking fed by HEARTBEAT messages

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use switchyard_core::{AgentMetrics, AgentStatus, Message};
use tokio::time::Instant;
use tracing::debug;

/// Last heartbeat observed from one peer
#[derive(Debug, Clone)]
pub struct PeerHealth {
    pub agent_id: String,
    pub status: Option<AgentStatus>,
    pub metrics: Option<AgentMetrics>,
    pub last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
}

impl PeerHealth {
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }

    /// Alive when fresh enough and not advertising ERROR/STOPPED
    pub fn is_alive(&self, stale_after: Duration) -> bool {
        let status_ok = self.status.is_none_or(|s| s.is_available());
        status_ok && self.age() <= stale_after
    }
}

/// Serializable view of a peer, for status reports
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub agent_id: String,
    pub status: Option<AgentStatus>,
    pub last_heartbeat: DateTime<Utc>,
    pub age_secs: f64,
}

/// Fields of a heartbeat payload
pub(crate) fn parse_heartbeat(message: &Message) -> (Option<AgentStatus>, Option<AgentMetrics>) {
    let status = message
        .payload
        .get("status")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let metrics = message
        .payload
        .get("metrics")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    (status, metrics)
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    peers: RwLock<HashMap<String, PeerHealth>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a HEARTBEAT message from a peer
    pub fn record(&self, message: &Message) {
        let (status, metrics) = parse_heartbeat(message);
        self.record_peer(&message.sender_id, status, metrics, message.timestamp);
    }

    pub fn record_peer(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        metrics: Option<AgentMetrics>,
        sent_at: DateTime<Utc>,
    ) {
        if agent_id.is_empty() {
            return;
        }
        debug!("Heartbeat from '{}' ({:?})", agent_id, status);
        self.peers.write().insert(
            agent_id.to_string(),
            PeerHealth {
                agent_id: agent_id.to_string(),
                status,
                metrics,
                last_heartbeat: sent_at,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn peer(&self, agent_id: &str) -> Option<PeerHealth> {
        self.peers.read().get(agent_id).cloned()
    }

    /// Whether a heartbeat from `agent_id` arrived within `stale_after`
    pub fn is_alive(&self, agent_id: &str, stale_after: Duration) -> bool {
        self.peers
            .read()
            .get(agent_id)
            .is_some_and(|p| p.is_alive(stale_after))
    }

    /// Ids of peers whose last heartbeat is older than `stale_after`
    pub fn stale_peers(&self, stale_after: Duration) -> Vec<String> {
        let mut stale: Vec<String> = self
            .peers
            .read()
            .values()
            .filter(|p| p.age() > stale_after)
            .map(|p| p.agent_id.clone())
            .collect();
        stale.sort();
        stale
    }

    pub fn forget(&self, agent_id: &str) -> bool {
        self.peers.write().remove(agent_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .read()
            .values()
            .map(|p| PeerSnapshot {
                agent_id: p.agent_id.clone(),
                status: p.status,
                last_heartbeat: p.last_heartbeat,
                age_secs: p.age().as_secs_f64(),
            })
            .collect();
        peers.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::MessageType;

    fn heartbeat(sender: &str, status: &str) -> Message {
        let mut msg = Message::broadcast(
            MessageType::Heartbeat,
            json!({"status": status, "metrics": AgentMetrics::default()}),
        );
        msg.sender_id = sender.to_string();
        msg
    }

    #[test]
    fn test_record_parses_status_and_metrics() {
        let monitor = HealthMonitor::new();
        monitor.record(&heartbeat("expert_1", "busy"));
        let peer = monitor.peer("expert_1").unwrap();
        assert_eq!(peer.status, Some(AgentStatus::Busy));
        assert_eq!(peer.metrics, Some(AgentMetrics::default()));
        assert!(monitor.is_alive("expert_1", Duration::from_secs(60)));
    }

    #[test]
    fn test_error_status_is_not_alive() {
        let monitor = HealthMonitor::new();
        monitor.record(&heartbeat("expert_1", "error"));
        assert!(!monitor.is_alive("expert_1", Duration::from_secs(60)));
        assert!(!monitor.is_alive("unknown", Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_goes_stale() {
        let monitor = HealthMonitor::new();
        monitor.record(&heartbeat("expert_1", "ready"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!monitor.is_alive("expert_1", Duration::from_secs(60)));
        assert_eq!(monitor.stale_peers(Duration::from_secs(60)), vec!["expert_1"]);
    }

    #[test]
    fn test_anonymous_heartbeat_ignored() {
        let monitor = HealthMonitor::new();
        monitor.record(&heartbeat("", "ready"));
        assert!(monitor.is_empty());
    }
}
