//! Caller-side access to a router

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use switchyard_core::{Error, Message, MessageBus, MessageType, Result, Task};
use tracing::{debug, warn};

use crate::runtime::{Agent, AgentConfig, Capability};

/// Retry settings for [`QueryClient::ask`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    /// Extra attempts after a timeout
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

/// Capability of an agent that only sends requests
struct Passive;

#[async_trait]
impl Capability for Passive {
    fn agent_type(&self) -> &str {
        "client"
    }

    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    async fn process_task(&self, _agent: &Agent, task: Task) -> Result<Value> {
        Err(Error::UnknownTaskType(task.task_type))
    }
}

/// A passive agent that sends queries to a router and waits for the answer
pub struct QueryClient {
    agent: Agent,
    router_id: String,
    config: ClientConfig,
}

impl QueryClient {
    pub fn new(
        id: impl Into<String>,
        router_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        config: ClientConfig,
        agent_config: AgentConfig,
    ) -> Self {
        Self {
            agent: Agent::new(id, Arc::new(Passive), bus, agent_config),
            router_id: router_id.into(),
            config,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub async fn start(&self) -> Result<()> {
        self.agent.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.agent.stop().await
    }

    /// Route `query` and return the expert's answer payload.
    ///
    /// Timeouts are retried up to `retries` times; typed failures from the
    /// router or the expert are returned as-is.
    pub async fn ask(&self, query: &str) -> Result<Value> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .agent
                .request(
                    &self.router_id,
                    MessageType::Query,
                    json!({"query": query}),
                    self.config.request_timeout,
                )
                .await;

            match outcome {
                Ok(reply) => return answer_from(reply),
                Err(Error::Timeout(id)) if attempt <= self.config.retries => {
                    warn!(
                        "Query {} timed out (attempt {}/{}), retrying",
                        id,
                        attempt,
                        self.config.retries + 1
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Turn a relayed reply into an answer or the typed error it describes
fn answer_from(reply: Message) -> Result<Value> {
    debug!("Reply {} ({})", reply.id, reply.message_type);
    if reply.message_type != MessageType::Error {
        return Ok(reply.payload);
    }

    let text = reply
        .payload_str("error")
        .unwrap_or("unknown error")
        .to_string();
    Err(match reply.payload_str("error_kind") {
        Some("NoExpertAvailable") => Error::NoExpertAvailable {
            category: reply.payload_str("category").unwrap_or_default().to_string(),
        },
        Some("ClassificationError") => Error::Classification(text),
        Some("Timeout") => Error::Timeout(text),
        _ => Error::Task(text),
    })
}
