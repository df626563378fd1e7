//! Specialized experts
//!
//! An [`Expert`] is a [`Capability`] over an external [`KnowledgeBackend`].
//! The profile decides which categories it registers under, what it
//! advertises and how it decorates answers.
//!
//! Answers are cached per query and `top_k` for a TTL (five minutes unless
//! configured). A task may pass `use_cache` to bypass or force the cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use switchyard_core::{Error, MessageBus, Result, Task};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::runtime::{Agent, AgentConfig, Capability};

/// Retrieval and answering, provided outside this crate
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Answer a question; the result should carry an `answer` field
    async fn query(&self, query: &str, top_k: usize) -> Result<Value>;

    /// Fetch the most relevant documents without generating an answer
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Value>>;

    /// Add documents, returning how many were indexed
    async fn index(&self, documents: Vec<Value>) -> Result<usize>;
}

/// Preset describing one kind of expert
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertProfile {
    pub agent_type: String,
    pub specialization: String,
    pub categories: Vec<String>,
    pub capabilities: Vec<String>,
    /// Documents to retrieve when a task does not say
    pub top_k: usize,
}

const BASE_CAPABILITIES: &[&str] = &[
    "document_retrieval",
    "question_answering",
    "knowledge_lookup",
    "context_provision",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl ExpertProfile {
    fn preset(specialization: &str, categories: &[&str], extra: &[&str], top_k: usize) -> Self {
        let mut capabilities = strings(BASE_CAPABILITIES);
        capabilities.extend(strings(extra));
        Self {
            agent_type: format!("{}_rag_agent", specialization),
            specialization: specialization.to_string(),
            categories: strings(categories),
            capabilities,
            top_k,
        }
    }

    pub fn general() -> Self {
        Self::preset(
            "general",
            &["general"],
            &["general_knowledge", "broad_topics", "fallback_handling"],
            5,
        )
    }

    pub fn technical() -> Self {
        Self::preset(
            "technical",
            &["technical", "engineering"],
            &[
                "technical_documentation",
                "api_reference",
                "architecture_explanation",
                "engineering_concepts",
            ],
            7,
        )
    }

    pub fn code() -> Self {
        Self::preset(
            "code",
            &["code", "programming"],
            &[
                "code_examples",
                "programming_tutorials",
                "debugging_assistance",
                "implementation_guidance",
                "code_explanation",
            ],
            5,
        )
    }

    pub fn medical() -> Self {
        Self::preset(
            "medical",
            &["medical", "healthcare"],
            &["clinical_reference", "symptom_lookup", "treatment_guidance"],
            5,
        )
    }

    pub fn legal() -> Self {
        Self::preset(
            "legal",
            &["legal"],
            &["statute_lookup", "case_reference", "compliance_guidance"],
            5,
        )
    }

    /// Look up a preset by specialization name
    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "general" => Some(Self::general()),
            "technical" => Some(Self::technical()),
            "code" => Some(Self::code()),
            "medical" => Some(Self::medical()),
            "legal" => Some(Self::legal()),
            _ => None,
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }
}

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
const CACHE_CAPACITY: usize = 512;

/// Retrieval counters reported in status
#[derive(Debug, Clone, Default, Serialize)]
pub struct RagMetrics {
    /// Queries answered by the backend; cache hits excluded
    pub queries_processed: u64,
    pub documents_retrieved: u64,
    /// Mean backend query time in seconds
    pub average_query_time: f64,
    pub cache_hits: u64,
}

struct CachedAnswer {
    stored_at: Instant,
    result: Value,
}

pub struct Expert {
    profile: ExpertProfile,
    backend: Arc<dyn KnowledgeBackend>,
    use_cache: bool,
    cache_ttl: Duration,
    cache: Mutex<LruCache<(String, usize), CachedAnswer>>,
    metrics: Mutex<RagMetrics>,
    query_time: Mutex<Duration>,
}

impl Expert {
    pub fn new(profile: ExpertProfile, backend: Arc<dyn KnowledgeBackend>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            profile,
            backend,
            use_cache: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(LruCache::new(capacity)),
            metrics: Mutex::new(RagMetrics::default()),
            query_time: Mutex::new(Duration::ZERO),
        }
    }

    /// Keep answers this long; zero disables caching
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self.use_cache = !ttl.is_zero();
        self
    }

    /// Only cache when a task asks for it with `use_cache`
    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn profile(&self) -> &ExpertProfile {
        &self.profile
    }

    pub fn rag_metrics(&self) -> RagMetrics {
        self.metrics.lock().clone()
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Wrap an expert in an agent on `bus`
    pub fn into_agent(
        self,
        id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        config: AgentConfig,
    ) -> Agent {
        Agent::new(id, Arc::new(self), bus, config)
    }

    fn top_k(&self, task: &Task) -> usize {
        task.parameters
            .get("top_k")
            .and_then(|v| v.as_u64())
            .map_or(self.profile.top_k, |k| k as usize)
    }

    fn use_cache(&self, task: &Task) -> bool {
        task.parameters
            .get("use_cache")
            .and_then(|v| v.as_bool())
            .unwrap_or(self.use_cache)
    }

    fn cached(&self, key: &(String, usize)) -> Option<Value> {
        let mut cache = self.cache.lock();
        let fresh = cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.result.clone());
        if fresh.is_none() {
            cache.pop(key);
        }
        fresh
    }

    async fn answer(&self, query: &str, top_k: usize, use_cache: bool) -> Result<Value> {
        let key = (query.to_string(), top_k);
        if use_cache {
            if let Some(result) = self.cached(&key) {
                self.metrics.lock().cache_hits += 1;
                debug!("Cache hit for query: {}", query);
                return Ok(result);
            }
        }

        let started = Instant::now();
        let result = self.decorate(self.backend.query(query, top_k).await?);
        let elapsed = started.elapsed();

        let retrieved = result
            .get("retrieved_documents")
            .and_then(|d| d.as_array())
            .map_or(0, |d| d.len());
        {
            let mut total = self.query_time.lock();
            *total += elapsed;
            let mut metrics = self.metrics.lock();
            metrics.queries_processed += 1;
            metrics.documents_retrieved += retrieved as u64;
            metrics.average_query_time =
                total.as_secs_f64() / metrics.queries_processed as f64;
        }

        if use_cache {
            self.cache.lock().put(
                key,
                CachedAnswer {
                    stored_at: Instant::now(),
                    result: result.clone(),
                },
            );
        }
        Ok(result)
    }

    fn decorate(&self, mut result: Value) -> Value {
        if let Value::Object(map) = &mut result {
            map.insert("specialization".into(), json!(self.profile.specialization));
            map.insert("agent_type".into(), json!(self.profile.agent_type));
            if self.profile.specialization == "code" {
                let contains_code = map
                    .get("answer")
                    .and_then(|a| a.as_str())
                    .is_some_and(|a| a.contains("```") || a.contains("def ") || a.contains("function "));
                map.insert("code_focused".into(), json!(true));
                map.insert("contains_code".into(), json!(contains_code));
            }
        }
        result
    }
}

fn required_query(task: &Task) -> Result<&str> {
    task.get_str("query")
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| Error::Task("Query is required".to_string()))
}

#[async_trait]
impl Capability for Expert {
    fn agent_type(&self) -> &str {
        &self.profile.agent_type
    }

    fn capabilities(&self) -> Vec<String> {
        self.profile.capabilities.clone()
    }

    async fn process_task(&self, agent: &Agent, task: Task) -> Result<Value> {
        match task.task_type.as_str() {
            "query" => {
                let query = required_query(&task)?;
                debug!("Expert '{}' answering: {}", agent.id(), query);
                self.answer(query, self.top_k(&task), self.use_cache(&task))
                    .await
            }
            "retrieve" => {
                let query = required_query(&task)?;
                let documents = self.backend.retrieve(query, self.top_k(&task)).await?;
                self.metrics.lock().documents_retrieved += documents.len() as u64;
                Ok(json!({
                    "query": query,
                    "count": documents.len(),
                    "documents": documents,
                }))
            }
            "index" => {
                let documents = match task.parameters.get("documents") {
                    Some(Value::Array(docs)) if !docs.is_empty() => docs.clone(),
                    _ => return Err(Error::Task("Documents are required".to_string())),
                };
                let indexed = self.backend.index(documents).await?;
                info!("Expert '{}' indexed {} documents", agent.id(), indexed);
                Ok(json!({
                    "indexed_count": indexed,
                    "message": format!("Successfully indexed {} documents", indexed),
                }))
            }
            other => Err(Error::UnknownTaskType(other.to_string())),
        }
    }

    fn status_details(&self) -> Value {
        json!({
            "specialization": self.profile.specialization,
            "categories": self.profile.categories,
            "top_k": self.profile.top_k,
            "rag_metrics": self.rag_metrics(),
            "cache_size": self.cache_size(),
        })
    }

    async fn on_stop(&self, agent: &Agent) -> Result<()> {
        let dropped = self.cache_size();
        self.clear_cache();
        debug!("Expert '{}' dropped {} cached answers", agent.id(), dropped);
        Ok(())
    }
}

/// In-memory backend that echoes queries back, for demos and tests
#[derive(Default)]
pub struct EchoBackend {
    latency: Duration,
    fail_on: Option<String>,
    documents: RwLock<Vec<Value>>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before every answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail any query containing `needle`
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    fn matching(&self, query: &str, top_k: usize) -> Vec<Value> {
        let words: Vec<String> = query
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        self.documents
            .read()
            .iter()
            .filter(|doc| {
                let text = doc.to_string().to_lowercase();
                words.iter().any(|w| text.contains(w.as_str()))
            })
            .take(top_k)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl KnowledgeBackend for EchoBackend {
    async fn query(&self, query: &str, top_k: usize) -> Result<Value> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(needle) = &self.fail_on {
            if query.contains(needle.as_str()) {
                return Err(Error::Task(format!("backend failed on '{}'", query)));
            }
        }
        let retrieved = self.matching(query, top_k);
        Ok(json!({
            "answer": format!("Echo: {}", query),
            "retrieved_documents": retrieved,
            "top_k": top_k,
        }))
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Value>> {
        Ok(self.matching(query, top_k))
    }

    async fn index(&self, documents: Vec<Value>) -> Result<usize> {
        let count = documents.len();
        self.documents.write().extend(documents);
        Ok(count)
    }
}
