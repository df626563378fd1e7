use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use switchyard_agents::{AgentConfig, Classifier, ClientConfig, RouterConfig, RoutingPolicy};
use switchyard_bus::BusOptions;
use switchyard_core::BusBackend;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub experts: Vec<ExpertSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_backend")]
    pub backend: BusBackend,
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,
    /// Use the in-process bus when the broker is unreachable
    #[serde(default = "default_true")]
    pub fallback_to_in_process: bool,
}

fn default_backend() -> BusBackend {
    BusBackend::InProcess
}

fn default_broker_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            broker_addr: default_broker_addr(),
            fallback_to_in_process: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            inbox_capacity: default_inbox_capacity(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSection {
    #[serde(default = "default_router_id")]
    pub id: String,
    #[serde(default)]
    pub policy: RoutingPolicy,
    /// Experts silent for this many heartbeat intervals are skipped (0 disables)
    #[serde(default = "default_stale_after_heartbeats")]
    pub stale_after_heartbeats: u32,
    /// Start from the built-in code/technical/medical/legal rules
    #[serde(default = "default_true")]
    pub default_categories: bool,
    /// Extra or replacement rules, checked after the built-in ones
    #[serde(default)]
    pub categories: Vec<CategorySection>,
}

fn default_router_id() -> String {
    "router".to_string()
}

fn default_stale_after_heartbeats() -> u32 {
    2
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            id: default_router_id(),
            policy: RoutingPolicy::default(),
            stale_after_heartbeats: default_stale_after_heartbeats(),
            default_categories: true,
            categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySection {
    pub name: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_client_id")]
    pub id: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_client_id() -> String {
    "cli".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    2
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            id: default_client_id(),
            request_timeout_secs: default_request_timeout(),
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertSection {
    pub id: String,
    /// Preset: general, technical, code, medical or legal
    pub profile: String,
    /// Overrides the preset's categories when non-empty
    #[serde(default)]
    pub categories: Vec<String>,
    /// Simulated backend latency
    #[serde(default)]
    pub latency_ms: u64,
    /// How long answers stay cached; 0 disables the cache
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl() -> u64 {
    300
}

impl SwitchyardConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `switchyard init` first.",
                path.display()
            )
        })?;

        Self::parse(&content).with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    /// Parse TOML after expanding allowlisted `${VAR}` references
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.heartbeat_interval_secs == 0 {
            bail!("agent.heartbeat_interval_secs must be greater than zero");
        }
        if self.agent.inbox_capacity == 0 {
            bail!("agent.inbox_capacity must be greater than zero");
        }
        if self.router.id.trim().is_empty() {
            bail!("router.id must not be empty");
        }

        let mut seen = vec![self.router.id.as_str(), self.client.id.as_str()];
        for expert in &self.experts {
            if switchyard_agents::ExpertProfile::by_name(&expert.profile).is_none() {
                bail!(
                    "expert '{}' has unknown profile '{}' (expected general, technical, code, medical or legal)",
                    expert.id,
                    expert.profile
                );
            }
            if seen.contains(&expert.id.as_str()) {
                bail!("agent id '{}' is used more than once", expert.id);
            }
            seen.push(&expert.id);
        }

        if self.bus.backend == BusBackend::Broker && self.bus.broker_addr.contains("${") {
            warn!(
                "bus.broker_addr still contains an unexpanded variable: {}",
                self.bus.broker_addr
            );
        }
        Ok(())
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            heartbeat_interval: Duration::from_secs(self.agent.heartbeat_interval_secs),
            inbox_capacity: self.agent.inbox_capacity,
            shutdown_grace: Duration::from_secs(self.agent.shutdown_grace_secs),
        }
    }

    pub fn router_config(&self) -> Result<RouterConfig> {
        let mut classifier = if self.router.default_categories {
            Classifier::with_defaults()
        } else {
            Classifier::new()
        };
        for category in &self.router.categories {
            classifier
                .add_category(&category.name, &category.patterns)
                .with_context(|| format!("Invalid patterns for category '{}'", category.name))?;
        }

        let stale_after = match self.router.stale_after_heartbeats {
            0 => None,
            n => Some(Duration::from_secs(self.agent.heartbeat_interval_secs) * n),
        };

        Ok(RouterConfig {
            policy: self.router.policy,
            stale_after,
            classifier,
        })
    }

    pub fn bus_options(&self) -> BusOptions {
        BusOptions {
            backend: self.bus.backend,
            broker_addr: self.bus.broker_addr.clone(),
            fallback_to_in_process: self.bus.fallback_to_in_process,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_secs(self.client.request_timeout_secs),
            retries: self.client.retries,
        }
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

/// Environment variables that may be referenced from the config file
const ALLOWED_ENV_VARS: &[&str] = &[
    "SWITCHYARD_BROKER_ADDR",
    "SWITCHYARD_ROUTER_ID",
    "SWITCHYARD_POLICY",
    "SWITCHYARD_CLIENT_ID",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        let Some(start) = result[pos..].find("${") else {
            break;
        };
        let abs_start = pos + start;
        let Some(end) = result[abs_start..].find('}') else {
            break;
        };
        let var_name = result[abs_start + 2..abs_start + end].to_string();

        if !ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
            warn!(
                "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                var_name
            );
            pos = abs_start + end + 1;
            continue;
        }

        let value = std::env::var(&var_name).unwrap_or_default();
        result = format!(
            "{}{}{}",
            &result[..abs_start],
            value,
            &result[abs_start + end + 1..]
        );
        pos = abs_start + value.len();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_parses() {
        let config = SwitchyardConfig::parse(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.router.id, "router");
        assert_eq!(config.router.policy, RoutingPolicy::RoundRobin);
        assert_eq!(config.bus.backend, BusBackend::InProcess);
        assert!(config.experts.iter().any(|e| e.profile == "general"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SwitchyardConfig::parse("").unwrap();
        assert_eq!(config.agent.heartbeat_interval_secs, 30);
        assert_eq!(config.client.retries, 2);
        assert!(config.experts.is_empty());

        let router = config.router_config().unwrap();
        assert_eq!(router.stale_after, Some(Duration::from_secs(60)));
        assert_eq!(
            router.classifier.categories(),
            vec!["code", "technical", "medical", "legal"]
        );
    }

    #[test]
    fn test_custom_categories_and_policy() {
        let config = SwitchyardConfig::parse(
            r#"
            [router]
            policy = "least_loaded"
            stale_after_heartbeats = 0
            default_categories = false

            [[router.categories]]
            name = "finance"
            patterns = ['\b(stock|bond|dividend)s?\b']
            "#,
        )
        .unwrap();
        let router = config.router_config().unwrap();
        assert_eq!(router.policy, RoutingPolicy::LeastLoaded);
        assert!(router.stale_after.is_none());
        assert_eq!(
            router.classifier.classify("Are bonds safe?").unwrap().category,
            "finance"
        );
    }

    #[test]
    fn test_rejects_invalid_settings() {
        assert!(SwitchyardConfig::parse("[agent]\nheartbeat_interval_secs = 0").is_err());
        assert!(SwitchyardConfig::parse("[router]\npolicy = \"random\"").is_err());
        assert!(
            SwitchyardConfig::parse("[[experts]]\nid = \"x\"\nprofile = \"astrology\"").is_err()
        );
        assert!(
            SwitchyardConfig::parse(
                "[[experts]]\nid = \"router\"\nprofile = \"general\""
            )
            .is_err()
        );

        let config = SwitchyardConfig::parse(
            "[[router.categories]]\nname = \"broken\"\npatterns = [\"(unclosed\"]",
        )
        .unwrap();
        assert!(config.router_config().is_err());
    }

    #[test]
    fn test_env_expansion_is_allowlisted() {
        // SAFETY: this is the only test touching this variable
        unsafe { std::env::set_var("SWITCHYARD_BROKER_ADDR", "10.0.0.5:9000") };
        let expanded = expand_env_vars(
            "broker_addr = \"${SWITCHYARD_BROKER_ADDR}\"\nsecret = \"${HOME}\"",
        );
        assert!(expanded.contains("broker_addr = \"10.0.0.5:9000\""));
        assert!(expanded.contains("secret = \"${HOME}\""));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[bus]\nbackend = \"broker\"\nbroker_addr = \"127.0.0.1:9999\"\n\n[[experts]]\nid = \"coder\"\nprofile = \"code\"\nlatency_ms = 10"
        )
        .unwrap();

        let config = SwitchyardConfig::load(&Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.bus.backend, BusBackend::Broker);
        assert_eq!(config.bus_options().broker_addr, "127.0.0.1:9999");
        assert_eq!(config.experts[0].latency_ms, 10);
        assert_eq!(config.experts[0].cache_ttl_secs, 300);

        let missing = SwitchyardConfig::load(&Some(PathBuf::from("/nonexistent/switchyard.toml")));
        assert!(missing.is_err());
    }
}
