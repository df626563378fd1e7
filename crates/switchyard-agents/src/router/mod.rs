//! Expert router
//!
//! The [`Router`] owns the expert registry, the classification rule table and
//! the routing metrics. Selection and the load increment it implies happen
//! under one lock, so concurrent `least_loaded` decisions always see each
//! other's increments.
//!
//! Health policy: the router never probes experts. It keeps its own view from
//! the HEARTBEAT broadcasts it receives (registration counts as a heartbeat)
//! and skips an expert whose last heartbeat is older than `stale_after` or
//! whose last heartbeat advertised ERROR or STOPPED. An expert announcing
//! STOPPED will never answer, so its pending routes are closed and each
//! requester gets an ERROR at once.
//!
//! [`RouterAgent`] puts a router on the bus: QUERY messages are routed and
//! forwarded to the chosen expert, and the expert's RESPONSE or ERROR is
//! relayed back to the requester under the requester's own correlation id.

pub mod classifier;
pub mod policy;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value, json};
use switchyard_core::{
    AgentStatus, Error, GENERAL_CATEGORY, Message, MessageBus, MessageType, Result, Task,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::health::parse_heartbeat;
use crate::runtime::{Agent, AgentConfig, Capability, handler_fn};

pub use classifier::{Classification, Classifier};
pub use policy::RoutingPolicy;
pub use registry::{ExpertRecord, ExpertSnapshot, Registry};

/// Router construction settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub policy: RoutingPolicy,
    /// Skip experts not heard from within this window; `None` disables the check
    pub stale_after: Option<Duration>,
    pub classifier: Classifier,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::default(),
            stale_after: Some(AgentConfig::default().heartbeat_interval * 2),
            classifier: Classifier::with_defaults(),
        }
    }
}

/// Outcome of one routing call
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub query: String,
    pub category: String,
    pub expert_id: String,
    pub policy: RoutingPolicy,
    /// Seconds spent classifying and selecting
    pub routing_time: f64,
    pub fallback: bool,
    /// Id of the QUERY forwarded to the expert
    pub message_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingMetrics {
    pub total_routed: u64,
    pub routes_by_category: BTreeMap<String, u64>,
    pub routes_by_expert: BTreeMap<String, u64>,
    pub fallback_count: u64,
    /// Seconds, classification and selection only
    pub average_routing_time: f64,
    pub failed_routes: u64,
}

/// A forwarded query awaiting the expert's reply
#[derive(Debug, Clone)]
pub struct PendingRoute {
    pub expert_id: String,
    pub category: String,
    pub requester_id: String,
    /// Correlation id the requester expects on the relayed reply
    pub reply_correlation: String,
    pub query: String,
    pub routed_at: DateTime<Utc>,
    started: Instant,
}

/// A pending route closed by the expert's reply
#[derive(Debug, Clone)]
pub struct CompletedRoute {
    pub route: PendingRoute,
    /// Seconds from forwarding to the reply
    pub response_time: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingStats {
    pub routing_metrics: RoutingMetrics,
    pub experts: Vec<ExpertSnapshot>,
    pub total_experts: usize,
    pub pending_routes: usize,
    pub load_balancing_strategy: RoutingPolicy,
}

#[derive(Default)]
struct RouterState {
    registry: Registry,
    cursors: HashMap<String, usize>,
    metrics: RoutingMetrics,
    pending: HashMap<String, PendingRoute>,
}

pub struct Router {
    policy: RoutingPolicy,
    stale_after: Option<Duration>,
    classifier: RwLock<Classifier>,
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            policy: config.policy,
            stale_after: config.stale_after,
            classifier: RwLock::new(config.classifier),
            state: Mutex::new(RouterState::default()),
        }
    }

    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    /// Insert or update an expert. Returns true for a new registration.
    pub fn register_expert(&self, expert_id: &str, categories: Vec<String>, metadata: Value) -> bool {
        self.state
            .lock()
            .registry
            .upsert(expert_id, categories, metadata)
    }

    /// Remove an expert. Queries already forwarded to it still complete.
    pub fn deregister_expert(&self, expert_id: &str) -> bool {
        self.state.lock().registry.remove(expert_id).is_some()
    }

    pub fn expert(&self, expert_id: &str) -> Option<ExpertSnapshot> {
        self.state
            .lock()
            .registry
            .get(expert_id)
            .map(ExpertRecord::snapshot)
    }

    pub fn add_category<S: AsRef<str>>(&self, name: &str, patterns: &[S]) -> Result<()> {
        self.classifier.write().add_category(name, patterns)
    }

    pub fn classify(&self, query: &str) -> Result<Classification> {
        self.classifier.read().classify(query)
    }

    /// Classify `query`, pick an expert and charge it one unit of load.
    ///
    /// Falls back to `general` when the category has no routable expert.
    pub fn select(&self, query: &str) -> Result<RoutingDecision> {
        let started = Instant::now();
        let classification = match self.classify(query) {
            Ok(c) => c,
            Err(e) => {
                self.state.lock().metrics.failed_routes += 1;
                return Err(e);
            }
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut category = classification.category.clone();
        let mut fallback = classification.fallback;
        let mut candidates = state.registry.candidates(&category, self.stale_after);
        if candidates.is_empty() && category != GENERAL_CATEGORY {
            debug!("No expert for category '{}', trying general", category);
            fallback = true;
            category = GENERAL_CATEGORY.to_string();
            candidates = state.registry.candidates(&category, self.stale_after);
        }
        if fallback {
            state.metrics.fallback_count += 1;
        }

        let cursor = state.cursors.entry(category.clone()).or_insert(0);
        let Some(idx) = self.policy.pick(&state.registry, &candidates, cursor) else {
            state.metrics.failed_routes += 1;
            warn!("No experts available for category: {}", classification.category);
            return Err(Error::NoExpertAvailable {
                category: classification.category,
            });
        };

        let expert = state.registry.at_mut(idx);
        expert.load += 1;
        expert.total_routed += 1;
        let expert_id = expert.expert_id.clone();

        let routing_time = started.elapsed().as_secs_f64();
        let metrics = &mut state.metrics;
        metrics.total_routed += 1;
        *metrics
            .routes_by_category
            .entry(category.clone())
            .or_default() += 1;
        *metrics
            .routes_by_expert
            .entry(expert_id.clone())
            .or_default() += 1;
        metrics.average_routing_time +=
            (routing_time - metrics.average_routing_time) / metrics.total_routed as f64;

        Ok(RoutingDecision {
            query: query.to_string(),
            category,
            expert_id,
            policy: self.policy,
            routing_time,
            fallback,
            message_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Select an expert and forward the query to it through `agent`.
    ///
    /// The expert's reply is relayed to `requester_id` carrying
    /// `reply_correlation`, or the forwarded message id when none is given.
    pub async fn route(
        &self,
        agent: &Agent,
        query: &str,
        requester_id: &str,
        reply_correlation: Option<String>,
    ) -> Result<RoutingDecision> {
        let decision = self.select(query)?;
        info!(
            "Routing {} query to expert {} ({})",
            decision.category, decision.expert_id, self.policy
        );

        let routed_at = Utc::now();
        let mut forward = Message::new(
            decision.expert_id.clone(),
            MessageType::Query,
            json!({
                "query": query,
                "category": decision.category,
                "requester_id": requester_id,
                "routed_at": routed_at,
            }),
        );
        forward.id = decision.message_id.clone();

        self.state.lock().pending.insert(
            forward.id.clone(),
            PendingRoute {
                expert_id: decision.expert_id.clone(),
                category: decision.category.clone(),
                requester_id: requester_id.to_string(),
                reply_correlation: reply_correlation.unwrap_or_else(|| forward.id.clone()),
                query: query.to_string(),
                routed_at,
                started: Instant::now(),
            },
        );

        if let Err(e) = agent.send_message(forward).await {
            let mut state = self.state.lock();
            state.pending.remove(&decision.message_id);
            if let Some(expert) = state.registry.get_mut(&decision.expert_id) {
                expert.load = expert.load.saturating_sub(1);
            }
            state.metrics.failed_routes += 1;
            return Err(e);
        }
        Ok(decision)
    }

    /// Close the pending route answered by `message` (a RESPONSE or ERROR
    /// correlated to a forwarded query). Load is released either way; only a
    /// RESPONSE feeds the response-time average.
    pub fn complete(&self, message: &Message) -> Option<CompletedRoute> {
        let correlation = message.correlation_id.as_deref()?;
        let mut state = self.state.lock();
        let route = state.pending.remove(correlation)?;
        let response_time = route.started.elapsed().as_secs_f64();

        if message.sender_id != route.expert_id {
            warn!(
                "Reply to {} came from '{}', expected '{}'",
                correlation, message.sender_id, route.expert_id
            );
        }
        if let Some(expert) = state.registry.get_mut(&route.expert_id) {
            if message.message_type == MessageType::Response {
                expert.record_completion(response_time);
            } else {
                expert.record_failure();
            }
        }
        Some(CompletedRoute {
            route,
            response_time,
        })
    }

    /// Close every pending route forwarded to `expert_id`, releasing its load.
    /// Used when the expert can no longer answer.
    pub fn abandon_routes(&self, expert_id: &str) -> Vec<PendingRoute> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, route)| route.expert_id == expert_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut abandoned: Vec<PendingRoute> = ids
            .iter()
            .filter_map(|id| state.pending.remove(id))
            .collect();
        abandoned.sort_by_key(|route| route.routed_at);

        if let Some(expert) = state.registry.get_mut(expert_id) {
            for _ in &abandoned {
                expert.record_failure();
            }
        }
        state.metrics.failed_routes += abandoned.len() as u64;
        if !abandoned.is_empty() {
            warn!(
                "Expert {} left with {} unanswered queries",
                expert_id,
                abandoned.len()
            );
        }
        abandoned
    }

    /// Feed a HEARTBEAT into the registry's health view
    pub fn observe_heartbeat(&self, message: &Message) -> bool {
        let (status, _) = parse_heartbeat(message);
        self.state
            .lock()
            .registry
            .observe_heartbeat(&message.sender_id, status)
    }

    pub fn metrics(&self) -> RoutingMetrics {
        self.state.lock().metrics.clone()
    }

    pub fn pending_routes(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn stats(&self) -> RoutingStats {
        let state = self.state.lock();
        RoutingStats {
            routing_metrics: state.metrics.clone(),
            experts: state.registry.iter().map(ExpertRecord::snapshot).collect(),
            total_experts: state.registry.len(),
            pending_routes: state.pending.len(),
            load_balancing_strategy: self.policy,
        }
    }

    fn register_expert_task(&self, task: &Task) -> Result<Value> {
        let expert_id = task
            .get_str("expert_id")
            .ok_or_else(|| Error::Task("expert_id is required".to_string()))?;
        let categories: Vec<String> = task
            .parameters
            .get("categories")
            .and_then(|v| v.as_array())
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let metadata = task
            .parameters
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let new = self.register_expert(expert_id, categories.clone(), metadata);
        Ok(json!({
            "registered": true,
            "new": new,
            "expert_id": expert_id,
            "categories": categories,
        }))
    }
}

#[async_trait]
impl Capability for Router {
    fn agent_type(&self) -> &str {
        "router"
    }

    fn capabilities(&self) -> Vec<String> {
        ["route_query", "register_expert", "deregister_expert", "get_routing_stats"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn process_task(&self, agent: &Agent, task: Task) -> Result<Value> {
        match task.task_type.as_str() {
            "route_query" => {
                let query = task.get_str("query").unwrap_or_default();
                let requester_id = task.get_str("requester_id").unwrap_or_default();
                let correlation = task.get_str("correlation_id").map(str::to_string);
                let decision = self.route(agent, query, requester_id, correlation).await?;
                Ok(serde_json::to_value(decision)?)
            }
            "register_expert" => self.register_expert_task(&task),
            "deregister_expert" => {
                let expert_id = task
                    .get_str("expert_id")
                    .ok_or_else(|| Error::Task("expert_id is required".to_string()))?;
                Ok(json!({
                    "deregistered": self.deregister_expert(expert_id),
                    "expert_id": expert_id,
                }))
            }
            "get_routing_stats" => Ok(serde_json::to_value(self.stats())?),
            other => Err(Error::UnknownTaskType(other.to_string())),
        }
    }

    fn status_details(&self) -> Value {
        let state = self.state.lock();
        json!({
            "routing_metrics": state.metrics,
            "registered_experts": state.registry.len(),
            "pending_routes": state.pending.len(),
            "load_balancing_strategy": self.policy,
        })
    }
}

/// A [`Router`] running as an agent on the bus
pub struct RouterAgent {
    agent: Agent,
    router: Arc<Router>,
}

impl RouterAgent {
    pub fn new(
        id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        config: RouterConfig,
        agent_config: AgentConfig,
    ) -> Self {
        let router = Arc::new(Router::new(config));
        let agent = Agent::new(id, router.clone(), bus, agent_config);

        agent.register_handler(MessageType::Query, handler_fn(handle_route_request));
        for reply_type in [MessageType::Response, MessageType::Error] {
            let router = router.clone();
            agent.register_handler(
                reply_type,
                handler_fn(move |agent, message| {
                    let router = router.clone();
                    async move { relay_expert_reply(&router, &agent, message).await }
                }),
            );
        }
        let heartbeat_router = router.clone();
        agent.register_handler(
            MessageType::Heartbeat,
            handler_fn(move |agent, message| {
                let router = heartbeat_router.clone();
                async move {
                    agent.health().record(&message);
                    let (status, _) = parse_heartbeat(&message);
                    if router.observe_heartbeat(&message) && status == Some(AgentStatus::Stopped) {
                        fail_abandoned_routes(&router, &agent, &message.sender_id).await?;
                    }
                    Ok(())
                }
            }),
        );

        Self { agent, router }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn id(&self) -> &str {
        self.agent.id()
    }

    pub async fn start(&self) -> Result<()> {
        self.agent.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.agent.stop().await
    }

    pub fn register_expert(&self, expert_id: &str, categories: Vec<String>, metadata: Value) -> bool {
        self.router.register_expert(expert_id, categories, metadata)
    }
}

/// Route a QUERY; failures go straight back to the requester as ERROR
async fn handle_route_request(agent: Agent, message: Message) -> Result<()> {
    let query = message.payload_str("query").unwrap_or_default().to_string();
    let task = Task::new("route_query")
        .with_param("query", query.clone())
        .with_param("requester_id", message.sender_id.clone())
        .with_param("correlation_id", message.id.clone());

    if let Err(e) = agent.process_task(task).await {
        let mut payload = json!({
            "query": query,
            "error": e.to_string(),
            "error_kind": e.kind(),
            "routed_by": agent.id(),
        });
        if let Error::NoExpertAvailable { category } = &e {
            payload["category"] = json!(category);
        }
        agent
            .send_message(message.reply(MessageType::Error, payload))
            .await?;
    }
    Ok(())
}

/// Tell each requester still waiting on `expert_id` that no answer will come
async fn fail_abandoned_routes(router: &Router, agent: &Agent, expert_id: &str) -> Result<()> {
    for route in router.abandon_routes(expert_id) {
        if route.requester_id.is_empty() {
            continue;
        }
        let err = Error::Task(format!("Expert '{}' stopped before answering", expert_id));
        let reply = Message::new(
            route.requester_id,
            MessageType::Error,
            json!({
                "query": route.query,
                "error": err.to_string(),
                "error_kind": err.kind(),
                "routed_by": agent.id(),
                "expert_id": expert_id,
                "category": route.category,
            }),
        )
        .with_correlation(route.reply_correlation);
        agent.send_message(reply).await?;
    }
    Ok(())
}

async fn relay_expert_reply(router: &Router, agent: &Agent, message: Message) -> Result<()> {
    let Some(done) = router.complete(&message) else {
        debug!(
            "No pending route for {} message {} from '{}'",
            message.message_type, message.id, message.sender_id
        );
        return Ok(());
    };
    info!(
        "Expert {} answered in {:.3}s",
        done.route.expert_id, done.response_time
    );
    if done.route.requester_id.is_empty() {
        return Ok(());
    }

    let mut payload = match message.payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    };
    payload.insert("routed_by".to_string(), json!(agent.id()));
    payload.insert("expert_id".to_string(), json!(done.route.expert_id));
    payload.insert("category".to_string(), json!(done.route.category));
    payload.insert(
        "routing_metadata".to_string(),
        json!({
            "response_time": done.response_time,
            "routed_at": done.route.routed_at,
        }),
    );

    let relay = Message::new(
        done.route.requester_id,
        message.message_type,
        Value::Object(payload),
    )
    .with_correlation(done.route.reply_correlation);
    agent.send_message(relay).await
}
