//! switchyard-core - shared vocabulary for the switchyard agents
//!
//! This crate provides:
//! - The message envelope, message kinds and agent status machine
//! - Task and task outcome types for the capability contract
//! - The error taxonomy used across the workspace
//! - The `MessageBus` trait every bus backend implements

pub mod bus;
pub mod error;
pub mod types;

pub use bus::{BusBackend, BusMetrics, Inbox, MessageBus};
pub use error::{Error, Result};
pub use types::{AgentMetrics, AgentStatus, Message, MessageType, Task, TaskOutcome};

/// Category every unclassified query falls back to
pub const GENERAL_CATEGORY: &str = "general";
