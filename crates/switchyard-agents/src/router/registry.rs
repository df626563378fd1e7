//! Expert registry owned by one router

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use switchyard_core::AgentStatus;
use tokio::time::Instant;
use tracing::info;

/// Router-side view of one expert
#[derive(Debug, Clone)]
pub struct ExpertRecord {
    pub expert_id: String,
    pub categories: Vec<String>,
    pub metadata: Value,
    /// Queries forwarded and not yet answered
    pub load: usize,
    pub total_routed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Seconds, over completed queries only
    pub avg_response_time: f64,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub reported_status: Option<AgentStatus>,
}

impl ExpertRecord {
    fn new(expert_id: &str, categories: Vec<String>, metadata: Value) -> Self {
        Self {
            expert_id: expert_id.to_string(),
            categories,
            metadata,
            load: 0,
            total_routed: 0,
            completed: 0,
            failed: 0,
            avg_response_time: 0.0,
            registered_at: Utc::now(),
            last_heartbeat: Instant::now(),
            reported_status: None,
        }
    }

    pub fn handles(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    /// Eligible for new work: not advertising ERROR/STOPPED and, when
    /// `stale_after` is set, heard from recently enough
    pub fn is_routable(&self, stale_after: Option<Duration>) -> bool {
        let status_ok = self.reported_status.is_none_or(|s| s.is_available());
        let fresh = stale_after.is_none_or(|limit| self.last_heartbeat.elapsed() <= limit);
        status_ok && fresh
    }

    pub(crate) fn record_completion(&mut self, response_time: f64) {
        self.load = self.load.saturating_sub(1);
        self.completed += 1;
        self.avg_response_time += (response_time - self.avg_response_time) / self.completed as f64;
    }

    pub(crate) fn record_failure(&mut self) {
        self.load = self.load.saturating_sub(1);
        self.failed += 1;
    }

    pub fn snapshot(&self) -> ExpertSnapshot {
        ExpertSnapshot {
            expert_id: self.expert_id.clone(),
            categories: self.categories.clone(),
            metadata: self.metadata.clone(),
            load: self.load,
            total_routed: self.total_routed,
            completed: self.completed,
            failed: self.failed,
            avg_response_time: self.avg_response_time,
            registered_at: self.registered_at,
            heartbeat_age_secs: self.last_heartbeat.elapsed().as_secs_f64(),
            reported_status: self.reported_status,
        }
    }
}

/// Serializable copy of an [`ExpertRecord`]
#[derive(Debug, Clone, Serialize)]
pub struct ExpertSnapshot {
    pub expert_id: String,
    pub categories: Vec<String>,
    pub metadata: Value,
    pub load: usize,
    pub total_routed: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_response_time: f64,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_age_secs: f64,
    pub reported_status: Option<AgentStatus>,
}

/// Experts in registration order
#[derive(Debug, Default)]
pub struct Registry {
    experts: Vec<ExpertRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update. An update keeps the registration slot and counters
    /// and replaces categories and metadata. Returns true for a new expert.
    pub fn upsert(&mut self, expert_id: &str, categories: Vec<String>, metadata: Value) -> bool {
        let mut unique: Vec<String> = Vec::with_capacity(categories.len());
        for category in categories {
            if !unique.contains(&category) {
                unique.push(category);
            }
        }

        match self.get_mut(expert_id) {
            Some(record) => {
                info!("Re-registered expert {} for categories: {:?}", expert_id, unique);
                record.categories = unique;
                record.metadata = metadata;
                record.last_heartbeat = Instant::now();
                false
            }
            None => {
                info!("Registered expert {} for categories: {:?}", expert_id, unique);
                self.experts
                    .push(ExpertRecord::new(expert_id, unique, metadata));
                true
            }
        }
    }

    pub fn remove(&mut self, expert_id: &str) -> Option<ExpertRecord> {
        let idx = self.experts.iter().position(|e| e.expert_id == expert_id)?;
        info!("Deregistered expert {}", expert_id);
        Some(self.experts.remove(idx))
    }

    pub fn get(&self, expert_id: &str) -> Option<&ExpertRecord> {
        self.experts.iter().find(|e| e.expert_id == expert_id)
    }

    pub fn get_mut(&mut self, expert_id: &str) -> Option<&mut ExpertRecord> {
        self.experts.iter_mut().find(|e| e.expert_id == expert_id)
    }

    /// Indexes of routable experts for `category`, in registration order
    pub fn candidates(&self, category: &str, stale_after: Option<Duration>) -> Vec<usize> {
        self.experts
            .iter()
            .enumerate()
            .filter(|(_, e)| e.handles(category) && e.is_routable(stale_after))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn at(&self, idx: usize) -> &ExpertRecord {
        &self.experts[idx]
    }

    pub fn at_mut(&mut self, idx: usize) -> &mut ExpertRecord {
        &mut self.experts[idx]
    }

    /// Note a heartbeat from a registered expert; unknown senders are ignored
    pub fn observe_heartbeat(&mut self, expert_id: &str, status: Option<AgentStatus>) -> bool {
        match self.get_mut(expert_id) {
            Some(record) => {
                record.last_heartbeat = Instant::now();
                if status.is_some() {
                    record.reported_status = status;
                }
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExpertRecord> {
        self.experts.iter()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}
