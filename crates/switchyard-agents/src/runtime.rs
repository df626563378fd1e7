//! Agent runtime
//!
//! An [`Agent`] wraps a [`Capability`] with the shared lifecycle: a bounded
//! inbox subscribed on the bus, per-type message handlers, a heartbeat loop,
//! metrics and correlated request/response. Each running agent owns three
//! tokio tasks under one cancellation token:
//!
//! - the inbox pump, which resolves replies to outstanding [`Agent::request`]
//!   calls and forwards everything else to the handler worker
//! - the handler worker, which runs handlers one at a time
//! - the heartbeat loop, which keeps broadcasting even while a handler stalls

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use switchyard_core::{
    AgentMetrics, AgentStatus, Error, Message, MessageBus, MessageType, Result, Task, TaskOutcome,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health::HealthMonitor;

/// What an agent can do. The runtime dispatches purely on `task_type`.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    fn agent_type(&self) -> &str;

    /// Task types this capability performs
    fn capabilities(&self) -> Vec<String>;

    async fn process_task(&self, agent: &Agent, task: Task) -> Result<Value>;

    /// Extra fields for status reports
    fn status_details(&self) -> Value {
        Value::Null
    }

    /// Runs once the agent is subscribed, before it becomes READY.
    /// An error leaves the agent in ERROR with nothing running.
    async fn on_start(&self, _agent: &Agent) -> Result<()> {
        Ok(())
    }

    /// Runs after the loops have stopped
    async fn on_stop(&self, _agent: &Agent) -> Result<()> {
        Ok(())
    }
}

/// Callback for one message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, agent: &Agent, message: Message) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Agent, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, agent: &Agent, message: Message) -> Result<()> {
        (self.0)(agent.clone(), message).await
    }
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Agent, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Runtime settings shared by every agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    /// Capacity of the bounded inbox the bus delivers into
    pub inbox_capacity: usize,
    /// How long `stop` waits for the loops before aborting them
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            inbox_capacity: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Read-only status snapshot returned by [`Agent::get_status`]
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub metrics: AgentMetrics,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

struct Lifecycle {
    status: AgentStatus,
    error_message: Option<String>,
    last_heartbeat: Option<(DateTime<Utc>, Instant)>,
    in_flight: usize,
}

struct AgentInner {
    id: String,
    config: AgentConfig,
    capability: Arc<dyn Capability>,
    bus: Arc<dyn MessageBus>,
    lifecycle: Mutex<Lifecycle>,
    metrics: Mutex<AgentMetrics>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    health: HealthMonitor,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running agent. Cloning is cheap and shares the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.inner.id)
            .field("agent_type", &self.inner.capability.agent_type())
            .field("status", &self.status())
            .finish()
    }
}

impl Agent {
    /// Create an agent with the default REQUEST, QUERY and HEARTBEAT handlers
    pub fn new(
        id: impl Into<String>,
        capability: Arc<dyn Capability>,
        bus: Arc<dyn MessageBus>,
        config: AgentConfig,
    ) -> Self {
        let agent = Self {
            inner: Arc::new(AgentInner {
                id: id.into(),
                config,
                capability,
                bus,
                lifecycle: Mutex::new(Lifecycle {
                    status: AgentStatus::Initializing,
                    error_message: None,
                    last_heartbeat: None,
                    in_flight: 0,
                }),
                metrics: Mutex::new(AgentMetrics::default()),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                health: HealthMonitor::new(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        agent.register_handler(MessageType::Request, handler_fn(handle_request));
        agent.register_handler(MessageType::Query, handler_fn(handle_query));
        agent.register_handler(MessageType::Heartbeat, handler_fn(handle_heartbeat));
        agent
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn agent_type(&self) -> &str {
        self.inner.capability.agent_type()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.inner.capability.capabilities()
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn status(&self) -> AgentStatus {
        self.inner.lifecycle.lock().status
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.lifecycle.lock().error_message.clone()
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.inner.metrics.lock().clone()
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.inner.lifecycle.lock().last_heartbeat.map(|(at, _)| at)
    }

    /// Liveness of peers, as seen through their heartbeats
    pub fn health(&self) -> &HealthMonitor {
        &self.inner.health
    }

    /// Install the handler for `message_type`, returning the one it replaces
    pub fn register_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        debug!("Agent '{}' handling {} messages", self.inner.id, message_type);
        self.inner.handlers.write().insert(message_type, handler)
    }

    pub fn unregister_handler(&self, message_type: MessageType) -> bool {
        self.inner.handlers.write().remove(&message_type).is_some()
    }

    /// Move to `next` if the lifecycle allows it
    pub fn transition(&self, next: AgentStatus) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let from = lifecycle.status;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        lifecycle.status = next;
        if from != next {
            debug!("Agent '{}' {} -> {}", self.inner.id, from, next);
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty()
    }

    /// Subscribe to the bus, run the capability's start hook, become READY
    /// and start the loops. An agent whose start hook failed may be started
    /// again.
    pub async fn start(&self) -> Result<()> {
        let status = self.status();
        let retry = status == AgentStatus::Error && !self.is_running();
        if status != AgentStatus::Initializing && !retry {
            return Err(Error::InvalidTransition {
                from: status,
                to: AgentStatus::Ready,
            });
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.inner.config.inbox_capacity.max(1));
        self.inner.bus.subscribe(&self.inner.id, inbox_tx).await?;

        if let Err(e) = self.inner.capability.on_start(self).await {
            error!("Agent '{}' failed to start: {}", self.inner.id, e);
            if let Err(e) = self.inner.bus.unsubscribe(&self.inner.id).await {
                warn!("Agent '{}' failed to unsubscribe: {}", self.inner.id, e);
            }
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.status = AgentStatus::Error;
            lifecycle.error_message = Some(e.to_string());
            return Err(e);
        }
        self.transition(AgentStatus::Ready)?;
        self.inner.lifecycle.lock().error_message = None;

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(self.clone().run_inbox(inbox_rx, work_tx));
        let worker = tokio::spawn(self.clone().run_handlers(work_rx));
        let heartbeat = tokio::spawn(self.clone().run_heartbeat());
        self.inner.tasks.lock().extend([pump, worker, heartbeat]);

        self.send_heartbeat().await;
        info!(
            "Agent '{}' ({}) started",
            self.inner.id,
            self.inner.capability.agent_type()
        );
        Ok(())
    }

    /// Unsubscribe, stop the loops and become STOPPED, from any state.
    ///
    /// A started agent first broadcasts a final STOPPED heartbeat so peers
    /// stop sending it work.
    pub async fn stop(&self) -> Result<()> {
        let status = self.status();
        if status == AgentStatus::Stopped {
            return Ok(());
        }

        if status != AgentStatus::Initializing {
            if let Err(e) = self.broadcast_heartbeat(AgentStatus::Stopped).await {
                warn!("Agent '{}' failed to announce stop: {}", self.inner.id, e);
            }
        }

        if let Err(e) = self.inner.bus.unsubscribe(&self.inner.id).await {
            warn!("Agent '{}' failed to unsubscribe: {}", self.inner.id, e);
        }

        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(self.inner.config.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                warn!(
                    "Agent '{}' loop did not stop within {:?}, aborting",
                    self.inner.id, self.inner.config.shutdown_grace
                );
                task.abort();
            }
        }

        if status != AgentStatus::Initializing {
            if let Err(e) = self.inner.capability.on_stop(self).await {
                warn!("Agent '{}' stop hook failed: {}", self.inner.id, e);
            }
        }

        // Waiters see a closed channel instead of hanging until their timeout
        self.inner.pending.lock().clear();
        self.inner.handlers.write().clear();
        self.inner.lifecycle.lock().status = AgentStatus::Stopped;
        info!("Agent '{}' stopped", self.inner.id);
        Ok(())
    }

    /// Leave ERROR and accept work again. An agent whose start failed must
    /// be started instead.
    pub async fn recover(&self) -> Result<()> {
        let status = self.status();
        if status != AgentStatus::Error || !self.is_running() {
            return Err(Error::InvalidTransition {
                from: status,
                to: AgentStatus::Ready,
            });
        }
        self.transition(AgentStatus::Ready)?;
        self.inner.lifecycle.lock().error_message = None;
        info!("Agent '{}' recovered", self.inner.id);
        self.send_heartbeat().await;
        Ok(())
    }

    /// Stamp sender and timestamp, then publish
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        message.sender_id = self.inner.id.clone();
        message.timestamp = Utc::now();
        self.inner.bus.publish(message).await?;
        self.inner.metrics.lock().messages_sent += 1;
        Ok(())
    }

    /// Send a message and wait for the reply carrying its id as correlation id.
    ///
    /// Expiry is reported as [`Error::Timeout`]; the receiver's work is not
    /// cancelled.
    pub async fn request(
        &self,
        receiver_id: &str,
        message_type: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> Result<Message> {
        let message = Message::new(receiver_id, message_type, payload);
        let id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        if let Err(e) = self.send_message(message).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Bus(format!(
                "agent '{}' stopped while awaiting reply to {}",
                self.inner.id, id
            ))),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(Error::Timeout(id))
            }
        }
    }

    /// Run a task through the capability, tracking BUSY and task metrics
    pub async fn process_task(&self, task: Task) -> Result<Value> {
        let task_type = task.task_type.clone();
        let started = Instant::now();
        self.begin_task();

        let result = AssertUnwindSafe(self.inner.capability.process_task(self, task))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::Task(format!(
                    "capability panicked: {}",
                    panic_message(&*panic)
                )))
            });

        let elapsed = started.elapsed().as_secs_f64();
        self.end_task(result.is_ok(), elapsed);
        match &result {
            Ok(_) => debug!(
                "Agent '{}' completed {} in {:.3}s",
                self.inner.id, task_type, elapsed
            ),
            Err(e) => warn!("Agent '{}' failed {}: {}", self.inner.id, task_type, e),
        }
        result
    }

    /// Same as [`process_task`](Self::process_task), in wire form
    pub async fn run_task(&self, task: Task) -> TaskOutcome {
        let started = Instant::now();
        match self.process_task(task).await {
            Ok(result) => TaskOutcome::ok(result, started.elapsed().as_secs_f64()),
            Err(e) => TaskOutcome::failed(&e, started.elapsed().as_secs_f64()),
        }
    }

    fn begin_task(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        lifecycle.in_flight += 1;
        if lifecycle.status == AgentStatus::Ready {
            lifecycle.status = AgentStatus::Busy;
        }
    }

    fn end_task(&self, succeeded: bool, elapsed: f64) {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.in_flight = lifecycle.in_flight.saturating_sub(1);
            if lifecycle.in_flight == 0 && lifecycle.status == AgentStatus::Busy {
                lifecycle.status = AgentStatus::Ready;
            }
        }
        let mut metrics = self.inner.metrics.lock();
        if succeeded {
            metrics.tasks_completed += 1;
        } else {
            metrics.tasks_failed += 1;
        }
        metrics.total_processing_time += elapsed;
    }

    /// READY or BUSY, with a heartbeat within the last interval
    pub fn is_healthy(&self) -> bool {
        let lifecycle = self.inner.lifecycle.lock();
        lifecycle.status.is_available()
            && lifecycle
                .last_heartbeat
                .is_some_and(|(_, at)| at.elapsed() <= self.inner.config.heartbeat_interval)
    }

    pub fn ensure_healthy(&self) -> Result<()> {
        if self.is_healthy() {
            return Ok(());
        }
        let elapsed_secs = self
            .inner
            .lifecycle
            .lock()
            .last_heartbeat
            .map_or(f64::INFINITY, |(_, at)| at.elapsed().as_secs_f64());
        Err(Error::AgentUnhealthy {
            agent_id: self.inner.id.clone(),
            elapsed_secs,
        })
    }

    pub fn get_status(&self) -> AgentStatusReport {
        let (status, error_message, last_heartbeat) = {
            let lifecycle = self.inner.lifecycle.lock();
            (
                lifecycle.status,
                lifecycle.error_message.clone(),
                lifecycle.last_heartbeat.map(|(at, _)| at),
            )
        };
        AgentStatusReport {
            agent_id: self.inner.id.clone(),
            agent_type: self.inner.capability.agent_type().to_string(),
            status,
            capabilities: self.inner.capability.capabilities(),
            metrics: self.metrics(),
            last_heartbeat,
            error_message,
            healthy: self.is_healthy(),
            details: self.inner.capability.status_details(),
        }
    }

    /// Broadcast one HEARTBEAT with the current status and metrics
    pub async fn send_heartbeat(&self) {
        let status = self.status();
        if status == AgentStatus::Stopped {
            return;
        }
        match self.broadcast_heartbeat(status).await {
            Ok(()) => {
                self.inner.lifecycle.lock().last_heartbeat = Some((Utc::now(), Instant::now()));
            }
            Err(e) => warn!("Agent '{}' failed to send heartbeat: {}", self.inner.id, e),
        }
    }

    async fn broadcast_heartbeat(&self, status: AgentStatus) -> Result<()> {
        let payload = json!({
            "status": status,
            "agent_type": self.inner.capability.agent_type(),
            "metrics": self.metrics(),
        });
        self.send_message(Message::broadcast(MessageType::Heartbeat, payload))
            .await
    }

    async fn run_inbox(
        self,
        mut inbox: mpsc::Receiver<Message>,
        work: mpsc::UnboundedSender<Message>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = inbox.recv() => {
                    let Some(message) = next else { break };
                    self.inner.metrics.lock().messages_received += 1;
                    if let Some(message) = self.resolve_pending(message) {
                        if work.send(message).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("Agent '{}' inbox pump exited", self.inner.id);
    }

    /// Hand a correlated reply to its waiter; anything else goes to handlers
    fn resolve_pending(&self, message: Message) -> Option<Message> {
        if !matches!(
            message.message_type,
            MessageType::Response | MessageType::Error
        ) {
            return Some(message);
        }
        let waiter = message
            .correlation_id
            .as_ref()
            .and_then(|id| self.inner.pending.lock().remove(id));
        match waiter {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("Agent '{}' reply arrived after waiter left", self.inner.id);
                }
                None
            }
            None => Some(message),
        }
    }

    async fn run_handlers(self, mut work: mpsc::UnboundedReceiver<Message>) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = work.recv() => match next {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                }
            }
        }
        debug!("Agent '{}' handler worker exited", self.inner.id);
    }

    async fn dispatch(&self, message: Message) {
        let handler = self
            .inner
            .handlers
            .read()
            .get(&message.message_type)
            .cloned();
        let Some(handler) = handler else {
            debug!(
                "Agent '{}' has no handler for {} message {}",
                self.inner.id, message.message_type, message.id
            );
            return;
        };

        let outcome = AssertUnwindSafe(handler.handle(self, message.clone()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => (e.to_string(), e.kind()),
            Err(panic) => (
                format!("handler panicked: {}", panic_message(&*panic)),
                "HandlerPanic",
            ),
        };
        self.handler_failed(&message, failure.0, failure.1).await;
    }

    /// ERROR status, ERROR reply to the sender and an immediate heartbeat
    async fn handler_failed(&self, message: &Message, cause: String, kind: &str) {
        error!(
            "Agent '{}' failed handling {} message {}: {}",
            self.inner.id, message.message_type, message.id, cause
        );
        if let Err(e) = self.transition(AgentStatus::Error) {
            debug!("Agent '{}' not moved to ERROR: {}", self.inner.id, e);
        }
        self.inner.lifecycle.lock().error_message = Some(cause.clone());

        if !message.sender_id.is_empty() && message.sender_id != self.inner.id {
            let reply = message.reply(
                MessageType::Error,
                json!({
                    "error": cause,
                    "error_kind": kind,
                    "agent_id": self.inner.id,
                    "original_type": message.message_type,
                }),
            );
            if let Err(e) = self.send_message(reply).await {
                warn!("Agent '{}' failed to report error: {}", self.inner.id, e);
            }
        }
        self.send_heartbeat().await;
    }

    async fn run_heartbeat(self) {
        let cancel = self.inner.cancel.clone();
        let period = self.inner.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.send_heartbeat().await,
            }
        }
        debug!("Agent '{}' heartbeat loop exited", self.inner.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn handle_request(agent: Agent, message: Message) -> Result<()> {
    let reply = match message.payload_str("request_type") {
        Some("get_status") => message.reply(
            MessageType::Response,
            serde_json::to_value(agent.get_status())?,
        ),
        Some("get_capabilities") => message.reply(
            MessageType::Response,
            json!({
                "agent_id": agent.id(),
                "capabilities": agent.capabilities(),
            }),
        ),
        other => match message.payload.get("task") {
            Some(task) => {
                let task = Task::from_value(task.clone(), "query");
                let outcome = agent.run_task(task).await;
                message.reply(MessageType::Response, outcome.to_value())
            }
            None => {
                let err = Error::UnknownTaskType(other.unwrap_or("<none>").to_string());
                message.reply(
                    MessageType::Error,
                    json!({"error": err.to_string(), "error_kind": err.kind()}),
                )
            }
        },
    };
    agent.send_message(reply).await
}

async fn handle_query(agent: Agent, message: Message) -> Result<()> {
    let query = message.payload_str("query").unwrap_or_default().to_string();
    let mut task = Task::from_value(message.payload.clone(), "query");
    task.task_type = "query".to_string();

    let started = Instant::now();
    let reply = match agent.process_task(task).await {
        Ok(result) => message.reply(
            MessageType::Response,
            json!({
                "query": query,
                "result": result,
                "agent_id": agent.id(),
                "processing_time": started.elapsed().as_secs_f64(),
            }),
        ),
        Err(e) => message.reply(
            MessageType::Error,
            json!({
                "query": query,
                "error": e.to_string(),
                "error_kind": e.kind(),
                "agent_id": agent.id(),
            }),
        ),
    };
    agent.send_message(reply).await
}

async fn handle_heartbeat(agent: Agent, message: Message) -> Result<()> {
    agent.health().record(&message);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchyard_bus::InProcessBus;

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        fn agent_type(&self) -> &str {
            "echo"
        }

        fn capabilities(&self) -> Vec<String> {
            vec!["query".to_string()]
        }

        async fn process_task(&self, _agent: &Agent, task: Task) -> Result<Value> {
            match task.task_type.as_str() {
                "query" => {
                    let query = task
                        .get_str("query")
                        .ok_or_else(|| Error::Task("Query is required".into()))?;
                    if let Some(ms) = task.parameters.get("delay_ms").and_then(|v| v.as_u64()) {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    Ok(json!({"answer": format!("echo: {}", query)}))
                }
                "panic" => panic!("capability exploded"),
                other => Err(Error::UnknownTaskType(other.to_string())),
            }
        }
    }

    async fn bus() -> Arc<InProcessBus> {
        let bus = Arc::new(InProcessBus::new());
        bus.start().await.unwrap();
        bus
    }

    fn config() -> AgentConfig {
        AgentConfig {
            heartbeat_interval: Duration::from_secs(30),
            inbox_capacity: 64,
            shutdown_grace: Duration::from_secs(1),
        }
    }

    async fn agent(id: &str, bus: &Arc<InProcessBus>) -> Agent {
        let agent = Agent::new(id, Arc::new(Echo), bus.clone(), config());
        agent.start().await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_start_makes_agent_ready_and_healthy() {
        let bus = bus().await;
        let a = Agent::new("a1", Arc::new(Echo), bus.clone(), config());
        assert_eq!(a.status(), AgentStatus::Initializing);
        assert!(!a.is_healthy());

        a.start().await.unwrap();
        assert_eq!(a.status(), AgentStatus::Ready);
        assert!(a.is_healthy());
        assert!(a.last_heartbeat().is_some());
        assert_eq!(a.metrics().messages_sent, 1);
        assert!(bus.is_subscribed("a1"));
        assert!(a.start().await.is_err());
    }

    /// Fails its first `failures` start hooks, counts stop hooks
    struct Hooked {
        failures: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Capability for Hooked {
        fn agent_type(&self) -> &str {
            "hooked"
        }

        fn capabilities(&self) -> Vec<String> {
            Vec::new()
        }

        async fn process_task(&self, agent: &Agent, task: Task) -> Result<Value> {
            Echo.process_task(agent, task).await
        }

        async fn on_start(&self, _agent: &Agent) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(Error::Task("backend unreachable".into()));
            }
            Ok(())
        }

        async fn on_stop(&self, _agent: &Agent) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_start_hook_failure_moves_agent_to_error() {
        let bus = bus().await;
        let hooked = Arc::new(Hooked {
            failures: AtomicUsize::new(1),
            stops: AtomicUsize::new(0),
        });
        let a = Agent::new("a1", hooked.clone(), bus.clone(), config());

        let err = a.start().await.unwrap_err();
        assert_eq!(err.kind(), "TaskError");
        assert_eq!(a.status(), AgentStatus::Error);
        assert_eq!(
            a.error_message().as_deref(),
            Some("Task error: backend unreachable")
        );
        assert!(!bus.is_subscribed("a1"));
        assert!(a.last_heartbeat().is_none());
        // Nothing is running, so there is nothing to recover
        assert!(a.recover().await.is_err());

        a.start().await.unwrap();
        assert_eq!(a.status(), AgentStatus::Ready);
        assert!(a.error_message().is_none());
        assert!(bus.is_subscribed("a1"));

        a.stop().await.unwrap();
        assert_eq!(hooked.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_hook_skipped_for_unstarted_agent() {
        let bus = bus().await;
        let hooked = Arc::new(Hooked {
            failures: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        let a = Agent::new("a1", hooked.clone(), bus.clone(), config());
        a.stop().await.unwrap();
        assert_eq!(a.status(), AgentStatus::Stopped);
        assert_eq!(hooked.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_unsubscribes_even_from_error() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;
        a.transition(AgentStatus::Error).unwrap();
        a.stop().await.unwrap();
        assert_eq!(a.status(), AgentStatus::Stopped);
        assert!(!bus.is_subscribed("a1"));
        assert!(a.transition(AgentStatus::Ready).is_err());
        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_announces_stopped_to_peers() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;
        let watcher = agent("watcher", &bus).await;

        a.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while watcher.health().peer("a1").and_then(|p| p.status) != Some(AgentStatus::Stopped) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!watcher.health().is_alive("a1", Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_send_to_stopped_agent_is_dropped_not_raised() {
        let bus = bus().await;
        let a1 = agent("a1", &bus).await;
        let a2 = agent("a2", &bus).await;
        a1.stop().await.unwrap();
        bus.flush().await;

        let before = bus.metrics().messages_dropped;
        a2.send_message(Message::new("a1", MessageType::Notification, json!({"hi": 1})))
            .await
            .unwrap();
        bus.flush().await;
        assert_eq!(bus.metrics().messages_dropped, before + 1);
        assert_eq!(a2.metrics().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_query_replies_with_correlated_response() {
        let bus = bus().await;
        let _expert = agent("expert", &bus).await;
        let caller = agent("caller", &bus).await;

        let reply = caller
            .request(
                "expert",
                MessageType::Query,
                json!({"query": "ping"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.sender_id, "expert");
        assert_eq!(reply.payload["result"]["answer"], "echo: ping");
    }

    #[tokio::test]
    async fn test_concurrent_requests_distinguished_by_correlation_id() {
        let bus = bus().await;
        let _expert = agent("expert", &bus).await;
        let caller = agent("caller", &bus).await;

        let slow = caller.request(
            "expert",
            MessageType::Query,
            json!({"query": "first", "delay_ms": 50}),
            Duration::from_secs(5),
        );
        let fast = caller.request(
            "expert",
            MessageType::Query,
            json!({"query": "second"}),
            Duration::from_secs(5),
        );
        let (slow, fast) = tokio::join!(slow, fast);
        let (slow, fast) = (slow.unwrap(), fast.unwrap());
        assert_ne!(slow.correlation_id, fast.correlation_id);
        assert_eq!(slow.payload["query"], "first");
        assert_eq!(fast.payload["query"], "second");
    }

    #[tokio::test]
    async fn test_concurrent_task_requests_distinguished_by_correlation_id() {
        let bus = bus().await;
        let expert = agent("expert", &bus).await;
        let caller = agent("caller", &bus).await;

        let slow = caller.request(
            "expert",
            MessageType::Request,
            json!({"task": {"task_type": "query", "query": "first", "delay_ms": 50}}),
            Duration::from_secs(5),
        );
        let fast = caller.request(
            "expert",
            MessageType::Request,
            json!({"task": {"task_type": "query", "query": "second"}}),
            Duration::from_secs(5),
        );
        let (slow, fast) = tokio::join!(slow, fast);
        let (slow, fast) = (slow.unwrap(), fast.unwrap());
        assert_ne!(slow.correlation_id, fast.correlation_id);
        assert_eq!(slow.payload["success"], true);
        assert_eq!(slow.payload["result"]["answer"], "echo: first");
        assert_eq!(fast.payload["result"]["answer"], "echo: second");
        assert_eq!(expert.metrics().tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let bus = bus().await;
        let caller = agent("caller", &bus).await;
        let silent = agent("silent", &bus).await;
        silent.unregister_handler(MessageType::Query);

        let err = caller
            .request(
                "silent",
                MessageType::Query,
                json!({"query": "anyone?"}),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_request_status_and_capabilities() {
        let bus = bus().await;
        let _expert = agent("expert", &bus).await;
        let caller = agent("caller", &bus).await;

        let status = caller
            .request(
                "expert",
                MessageType::Request,
                json!({"request_type": "get_status"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(status.payload["agent_id"], "expert");
        assert_eq!(status.payload["agent_type"], "echo");

        let caps = caller
            .request(
                "expert",
                MessageType::Request,
                json!({"request_type": "get_capabilities"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(caps.payload["capabilities"], json!(["query"]));
    }

    #[tokio::test]
    async fn test_request_task_reports_outcome() {
        let bus = bus().await;
        let expert = agent("expert", &bus).await;
        let caller = agent("caller", &bus).await;

        let reply = caller
            .request(
                "expert",
                MessageType::Request,
                json!({"task": {"task_type": "translate"}}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload["success"], false);
        assert_eq!(reply.payload["error_kind"], "TaskError");
        assert_eq!(expert.metrics().tasks_failed, 1);
        // Task failures are returned to the caller, not treated as crashes
        assert_eq!(expert.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_process_task_updates_metrics_and_status() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;

        let result = a
            .process_task(Task::new("query").with_param("query", "hello"))
            .await
            .unwrap();
        assert_eq!(result["answer"], "echo: hello");
        assert!(a.process_task(Task::new("query")).await.is_err());

        let err = a.process_task(Task::new("panic")).await.unwrap_err();
        assert!(matches!(err, Error::Task(_)));

        let metrics = a.metrics();
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 2);
        assert_eq!(a.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_busy_while_task_in_flight() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;

        let running = a.clone();
        let task = tokio::spawn(async move {
            running
                .process_task(
                    Task::new("query")
                        .with_param("query", "slow")
                        .with_param("delay_ms", 100),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.status(), AgentStatus::Busy);
        task.await.unwrap().unwrap();
        assert_eq!(a.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_handler_panic_sets_error_and_notifies_sender() {
        let bus = bus().await;
        let victim = agent("victim", &bus).await;
        let caller = agent("caller", &bus).await;

        victim.register_handler(
            MessageType::Notification,
            handler_fn(|_agent, _message| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            }),
        );

        let reply = caller
            .request(
                "victim",
                MessageType::Notification,
                json!({}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.payload["error_kind"], "HandlerPanic");
        assert!(reply.payload["error"].as_str().unwrap().contains("boom"));

        assert_eq!(victim.status(), AgentStatus::Error);
        assert!(victim.error_message().unwrap().contains("boom"));
        assert!(!victim.is_healthy());
        assert!(matches!(
            victim.ensure_healthy(),
            Err(Error::AgentUnhealthy { .. })
        ));

        victim.recover().await.unwrap();
        assert_eq!(victim.status(), AgentStatus::Ready);
        assert!(victim.error_message().is_none());
        assert!(victim.is_healthy());
    }

    #[tokio::test]
    async fn test_handler_error_advertised_in_heartbeat() {
        let bus = bus().await;
        let victim = agent("victim", &bus).await;
        let observer = agent("observer", &bus).await;

        victim.register_handler(
            MessageType::Notification,
            handler_fn(|_agent, _message| async move { Err(Error::Task("bad input".into())) }),
        );
        observer
            .send_message(Message::new("victim", MessageType::Notification, json!({})))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let seen = observer.health().peer("victim").and_then(|p| p.status);
                if seen == Some(AgentStatus::Error) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(victim.error_message().as_deref(), Some("Task error: bad input"));
    }

    #[tokio::test]
    async fn test_register_handler_replaces() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;
        let caller = agent("caller", &bus).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        a.register_handler(
            MessageType::Notification,
            handler_fn(move |_agent, _message| {
                let first = first.clone();
                async move {
                    first.fetch_add(100, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        let second = calls.clone();
        let replaced = a.register_handler(
            MessageType::Notification,
            handler_fn(move |agent, message| {
                let second = second.clone();
                async move {
                    second.fetch_add(1, Ordering::SeqCst);
                    agent
                        .send_message(message.reply(MessageType::Response, json!({})))
                        .await
                }
            }),
        );
        assert!(replaced.is_some());

        caller
            .request(
                "a1",
                MessageType::Notification,
                json!({}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_loop_keeps_agent_healthy() {
        let bus = bus().await;
        let a = Agent::new(
            "a1",
            Arc::new(Echo),
            bus.clone(),
            AgentConfig {
                heartbeat_interval: Duration::from_secs(10),
                ..config()
            },
        );
        a.start().await.unwrap();
        let sent = a.metrics().messages_sent;

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(a.metrics().messages_sent >= sent + 2);
        assert!(a.is_healthy());
    }

    #[tokio::test]
    async fn test_get_status_report() {
        let bus = bus().await;
        let a = agent("a1", &bus).await;
        let report = a.get_status();
        assert_eq!(report.agent_id, "a1");
        assert_eq!(report.status, AgentStatus::Ready);
        assert_eq!(report.capabilities, vec!["query"]);
        assert!(report.healthy);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["status"], "ready");
        assert!(v.get("details").is_none());
    }
}
