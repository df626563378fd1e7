use thiserror::Error;

use crate::types::AgentStatus;

#[derive(Error, Debug)]
pub enum Error {
    /// Empty or malformed query
    #[error("Classification error: {0}")]
    Classification(String),

    /// Neither the resolved category nor the general fallback has a routable expert
    #[error("No expert available for category '{category}'")]
    NoExpertAvailable { category: String },

    /// Capability invocation failed or reported `success = false`
    #[error("Task error: {0}")]
    Task(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// No active subscriber; logged and counted, never raised to a publisher
    #[error("Delivery failure: no subscriber for '{0}'")]
    DeliveryFailure(String),

    #[error("Agent '{agent_id}' unhealthy: last heartbeat {elapsed_secs:.1}s ago")]
    AgentUnhealthy { agent_id: String, elapsed_secs: f64 },

    #[error("Timed out waiting for response to {0}")]
    Timeout(String),

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable name carried in ERROR payloads as `error_kind`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Classification(_) => "ClassificationError",
            Self::NoExpertAvailable { .. } => "NoExpertAvailable",
            Self::Task(_) => "TaskError",
            Self::UnknownTaskType(_) => "TaskError",
            Self::DeliveryFailure(_) => "DeliveryFailure",
            Self::AgentUnhealthy { .. } => "AgentUnhealthy",
            Self::Timeout(_) => "Timeout",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::Bus(_) => "BusError",
            Self::Config(_) => "ConfigError",
            Self::Json(_) => "JsonError",
            Self::Io(_) => "IoError",
        }
    }

    /// Failures a caller may retry; the framework itself never does
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Task(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct_for_routing_failures() {
        let classification = Error::Classification("empty".into());
        let unavailable = Error::NoExpertAvailable {
            category: "general".into(),
        };
        assert_ne!(classification.kind(), unavailable.kind());
        assert_eq!(unavailable.to_string(), "No expert available for category 'general'");
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout("abc".into()).is_retryable());
        assert!(Error::Task("boom".into()).is_retryable());
        assert!(!Error::Classification("".into()).is_retryable());
        assert!(
            !Error::NoExpertAvailable {
                category: "code".into()
            }
            .is_retryable()
        );
    }
}
