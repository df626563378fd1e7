//! Shared types for switchyard-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of inter-agent message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Query,
    Response,
    Request,
    Notification,
    Heartbeat,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Response => write!(f, "response"),
            Self::Request => write!(f, "request"),
            Self::Notification => write!(f, "notification"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Message exchanged over the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub sender_id: String,
    /// Empty for broadcast
    #[serde(default)]
    pub receiver_id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message addressed to `receiver_id` (empty string broadcasts)
    pub fn new(receiver_id: impl Into<String>, message_type: MessageType, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: String::new(),
            receiver_id: receiver_id.into(),
            message_type,
            payload,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a broadcast message
    pub fn broadcast(message_type: MessageType, payload: Value) -> Self {
        Self::new(String::new(), message_type, payload)
    }

    /// Build a reply addressed to this message's sender, correlated to its id
    pub fn reply(&self, message_type: MessageType, payload: Value) -> Self {
        Self::new(self.sender_id.clone(), message_type, payload).with_correlation(self.id.clone())
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_empty()
    }

    /// Fetch a string field from an object payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Operational status of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Initializing,
    Ready,
    Busy,
    Error,
    Stopped,
}

impl AgentStatus {
    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// STOPPED is terminal; ERROR is reachable from every other state;
    /// ERROR only leaves through READY (recovery) or STOPPED.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (_, Error) => true,
            (Initializing, Ready) => true,
            (Ready, Busy) | (Busy, Ready) => true,
            (Ready, Ready) | (Busy, Busy) => true,
            (Error, Ready) => true,
            _ => false,
        }
    }

    /// READY and BUSY agents accept routed work
    pub fn is_available(self) -> bool {
        matches!(self, AgentStatus::Ready | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Unit of work handed to a capability: `{task_type, ...parameters}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_type: String,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl Task {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    /// Parse a task from a JSON object, defaulting `task_type` when absent
    pub fn from_value(value: Value, default_type: &str) -> Self {
        let mut parameters = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let task_type = match parameters.remove("task_type") {
            Some(Value::String(s)) => s,
            _ => default_type.to_string(),
        };
        Self {
            task_type,
            parameters,
        }
    }
}

/// Wire form of a capability result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Seconds spent inside the capability
    #[serde(default)]
    pub processing_time: f64,
}

impl TaskOutcome {
    pub fn ok(result: Value, processing_time: f64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            error_kind: None,
            processing_time,
        }
    }

    pub fn failed(error: &crate::Error, processing_time: f64) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            processing_time,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Counters kept by every agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Seconds
    pub total_processing_time: f64,
}
