//! switchyard-agents - agents on the switchyard bus
//!
//! This crate provides:
//! - The agent runtime: lifecycle, handlers, heartbeat, metrics and
//!   correlated request/response over any `MessageBus`
//! - The expert router with pattern classification and load balancing
//! - Specialized experts over a pluggable knowledge backend, with an
//!   answer cache
//! - A query client for callers outside the agent mesh

pub mod client;
pub mod experts;
pub mod health;
pub mod router;
pub mod runtime;

pub use client::{ClientConfig, QueryClient};
pub use experts::{EchoBackend, Expert, ExpertProfile, KnowledgeBackend, RagMetrics};
pub use health::{HealthMonitor, PeerHealth};
pub use router::{
    Classification, Classifier, Router, RouterAgent, RouterConfig, RoutingDecision,
    RoutingMetrics, RoutingPolicy, RoutingStats,
};
pub use runtime::{
    Agent, AgentConfig, AgentStatusReport, Capability, MessageHandler, handler_fn,
};
