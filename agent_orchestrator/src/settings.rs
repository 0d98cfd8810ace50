//! Configuration management with environment variable support and validation.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::selector::SelectionPolicy;
use crate::task::GENERAL_TASK_TYPE;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
    pub enable_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
            enable_thread_ids: false,
        }
    }
}

/// Agent pool sizing and eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub acquire_timeout_ms: u64,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Consecutive failed tasks after which an instance is retired.
    pub max_consecutive_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 5_000,
            idle_ttl_secs: 300,
            sweep_interval_secs: 30,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Below this top confidence the task goes to the general kind, when one exists.
    pub min_routing_confidence: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            min_routing_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Finished tasks (and their routing decisions) kept for lookup before the
    /// oldest are evicted.
    pub retention: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { retention: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentRuleConfig {
    pub task_type: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Confidence assigned when any pattern matches.
    #[serde(default = "default_pattern_confidence")]
    pub confidence: f32,
}

fn default_pattern_confidence() -> f32 {
    0.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Results below this floor are dropped.
    pub min_confidence: f32,
    /// A pattern hit at or above this skips the model-assisted pass.
    pub short_circuit_threshold: f32,
    /// Confidence contributed by each matched keyword.
    pub keyword_weight: f32,
    /// Upper bound for keyword-only confidence.
    pub keyword_cap: f32,
    /// Task type under which model-assisted classification is routed through the
    /// selector. Unset disables the model pass.
    pub model_task_type: Option<String>,
    #[serde(default)]
    pub rules: Vec<IntentRuleConfig>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.2,
            short_circuit_threshold: 0.85,
            keyword_weight: 0.25,
            keyword_cap: 0.8,
            model_task_type: None,
            rules: vec![
                IntentRuleConfig {
                    task_type: "metrics_report".to_string(),
                    patterns: vec![r"(?i)\b(metrics?|kpi)\s+report\b".to_string()],
                    keywords: vec!["metrics".to_string(), "dashboard".to_string(), "kpi".to_string()],
                    confidence: 0.9,
                },
                IntentRuleConfig {
                    task_type: "crm_sync".to_string(),
                    patterns: vec![r"(?i)\bsync\b.*\b(crm|deals?|contacts?)\b".to_string()],
                    keywords: vec!["crm".to_string(), "deal".to_string(), "contact".to_string()],
                    confidence: 0.9,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKindConfig {
    pub name: String,
    pub task_types: Vec<String>,
    pub max_instances: usize,
    /// Lower values are tried first when several kinds handle a task type.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    /// Only "echo" is built in; other providers are injected programmatically.
    pub provider: String,
    pub cost_per_call: f64,
    pub latency_ms: u64,
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub call_timeout_ms: u64,
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub default_policy: SelectionPolicy,
    pub backends: Vec<BackendConfig>,
    /// Task type → ranked backend ids.
    pub routes: HashMap<String, Vec<String>>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            GENERAL_TASK_TYPE.to_string(),
            vec!["local-echo".to_string(), "hosted-echo".to_string()],
        );

        Self {
            call_timeout_ms: 30_000,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            default_policy: SelectionPolicy::default(),
            backends: vec![
                BackendConfig {
                    id: "local-echo".to_string(),
                    provider: "echo".to_string(),
                    cost_per_call: 0.0,
                    latency_ms: 5,
                    local: true,
                },
                BackendConfig {
                    id: "hosted-echo".to_string(),
                    provider: "echo".to_string(),
                    cost_per_call: 0.002,
                    latency_ms: 50,
                    local: false,
                },
            ],
            routes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub limit_per_window: f64,
    pub window_secs: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_per_window: 10.0,
            window_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub provider: String, // "in_memory" or "sled"
    pub path: Option<PathBuf>,
    pub consolidation_interval_secs: u64,
    pub consolidation_batch_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: "in_memory".to_string(),
            path: None,
            consolidation_interval_secs: 30,
            consolidation_batch_size: 256,
        }
    }
}

/// Main settings structure with all configuration sections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub pool: PoolConfig,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    pub classifier: ClassifierConfig,
    pub agents: Vec<AgentKindConfig>,
    pub selector: SelectorConfig,
    pub budget: BudgetConfig,
    pub memory: MemoryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            pool: PoolConfig::default(),
            routing: RoutingConfig::default(),
            tasks: TaskConfig::default(),
            classifier: ClassifierConfig::default(),
            agents: vec![
                AgentKindConfig {
                    name: "MetricsAgent".to_string(),
                    task_types: vec!["metrics_report".to_string()],
                    max_instances: 2,
                    priority: 0,
                    instructions: Some("You compile concise metrics reports.".to_string()),
                },
                AgentKindConfig {
                    name: "CrmAgent".to_string(),
                    task_types: vec!["crm_sync".to_string()],
                    max_instances: 2,
                    priority: 0,
                    instructions: None,
                },
                AgentKindConfig {
                    name: "GeneralAgent".to_string(),
                    task_types: vec![GENERAL_TASK_TYPE.to_string()],
                    max_instances: 4,
                    priority: 10,
                    instructions: None,
                },
            ],
            selector: SelectorConfig::default(),
            budget: BudgetConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the embedded defaults, an optional file and `ORCH__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(
                include_str!("../config.toml"),
                FileFormat::Toml,
            ));

        builder = match path {
            Some(p) => builder.add_source(File::from(p.to_path_buf()).required(true)),
            None => builder.add_source(File::with_name("orchestrator").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("ORCH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration sources")?;

        let mut settings: Settings = config
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        Self::apply_env_overrides(&mut settings)?;
        settings.validate()?;

        Ok(settings)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
        if let Ok(path) = std::env::var("ORCH_MEMORY_PATH") {
            settings.memory.provider = "sled".to_string();
            settings.memory.path = Some(PathBuf::from(path));
        }

        if let Ok(limit) = std::env::var("ORCH_BUDGET_LIMIT") {
            settings.budget.limit_per_window = limit
                .parse()
                .with_context(|| format!("ORCH_BUDGET_LIMIT is not a number: {}", limit))?;
        }

        Ok(())
    }

    /// Validate settings for consistency
    pub fn validate(&self) -> Result<()> {
        if self.pool.acquire_timeout_ms == 0 {
            return Err(anyhow!("pool.acquire_timeout_ms must be positive"));
        }
        if self.pool.sweep_interval_secs == 0 {
            return Err(anyhow!("pool.sweep_interval_secs must be positive"));
        }

        for (name, value) in [
            ("routing.min_routing_confidence", self.routing.min_routing_confidence),
            ("classifier.min_confidence", self.classifier.min_confidence),
            ("classifier.short_circuit_threshold", self.classifier.short_circuit_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }

        if self.tasks.retention == 0 {
            return Err(anyhow!("tasks.retention must be positive"));
        }

        if self.agents.is_empty() {
            return Err(anyhow!("At least one agent kind must be configured"));
        }
        let mut kind_names = HashSet::new();
        for kind in &self.agents {
            if !kind_names.insert(kind.name.as_str()) {
                return Err(anyhow!("Duplicate agent kind '{}'", kind.name));
            }
            if kind.max_instances == 0 {
                return Err(anyhow!("Agent kind '{}' must allow at least one instance", kind.name));
            }
            if kind.task_types.is_empty() {
                return Err(anyhow!("Agent kind '{}' declares no task types", kind.name));
            }
        }

        if self.selector.max_attempts == 0 {
            return Err(anyhow!("selector.max_attempts must be positive"));
        }
        if self.selector.backoff_multiplier < 1.0 {
            return Err(anyhow!("selector.backoff_multiplier must be >= 1.0"));
        }
        let mut backend_ids = HashSet::new();
        for backend in &self.selector.backends {
            if !backend_ids.insert(backend.id.as_str()) {
                return Err(anyhow!("Duplicate backend '{}'", backend.id));
            }
            if backend.cost_per_call < 0.0 {
                return Err(anyhow!("Backend '{}' has a negative cost", backend.id));
            }
        }
        for (task_type, ranked) in &self.selector.routes {
            for id in ranked {
                if !backend_ids.contains(id.as_str()) {
                    return Err(anyhow!(
                        "Route for '{}' references unknown backend '{}'",
                        task_type, id
                    ));
                }
            }
        }

        for kind in &self.agents {
            for task_type in &kind.task_types {
                let routed = self.selector.routes.contains_key(task_type.as_str())
                    || self.selector.routes.contains_key(GENERAL_TASK_TYPE);
                if !routed {
                    warn!(
                        "Task type '{}' of agent kind '{}' has no backend route",
                        task_type, kind.name
                    );
                }
            }
        }

        if self.budget.limit_per_window < 0.0 {
            return Err(anyhow!("budget.limit_per_window cannot be negative"));
        }
        if self.budget.window_secs == 0 {
            return Err(anyhow!("budget.window_secs must be positive"));
        }

        if self.memory.provider == "sled" && self.memory.path.is_none() {
            return Err(anyhow!("sled memory provider requires memory.path or ORCH_MEMORY_PATH"));
        }
        if self.memory.provider != "sled" && self.memory.provider != "in_memory" {
            return Err(anyhow!("Unknown memory provider '{}'", self.memory.provider));
        }
        if self.memory.consolidation_batch_size == 0 {
            return Err(anyhow!("memory.consolidation_batch_size must be positive"));
        }

        Ok(())
    }

    /// Get a configuration value by JSON pointer (e.g., "/pool/idle_ttl_secs")
    pub fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = serde_json::to_value(self)?;
        let value = value
            .pointer(path)
            .ok_or_else(|| anyhow!("Configuration path not found: {}", path))?;

        Ok(serde_json::from_value(value.clone())?)
    }
}
