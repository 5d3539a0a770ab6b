//! Configuration for the orchestration engine.
//!
//! Holds intervals, thresholds, and the static per-agent-type table that the
//! scheduler, auto-scaler, priority manager, and workload balancer share.
//! Values come from `Default`, environment variables (`from_env`), or builder
//! methods; `validate` rejects inconsistent combinations up front.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Relative importance of an agent type when scaling recommendations
/// compete within one cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TypePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for TypePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypePriority::Critical => write!(f, "critical"),
            TypePriority::High => write!(f, "high"),
            TypePriority::Medium => write!(f, "medium"),
            TypePriority::Low => write!(f, "low"),
        }
    }
}

impl FromStr for TypePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(TypePriority::Critical),
            "high" => Ok(TypePriority::High),
            "medium" => Ok(TypePriority::Medium),
            "low" => Ok(TypePriority::Low),
            other => Err(format!("unknown type priority '{other}'")),
        }
    }
}

/// Static description of one agent type the engine manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTypeConfig {
    /// Type name; doubles as the per-type queue suffix (`queue:<type>`).
    pub agent_type: String,
    /// Capabilities every worker of this type advertises.
    pub capabilities: Vec<String>,
    /// Capability tiers used by the workload balancer's fit scoring.
    pub primary_capabilities: Vec<String>,
    pub secondary_capabilities: Vec<String>,
    pub emergency_capabilities: Vec<String>,
    /// Instance bounds enforced by the auto-scaler.
    pub min_instances: usize,
    pub max_instances: usize,
    /// Per-worker concurrency passed to spawned agents.
    pub max_concurrency: u32,
    /// Importance of this type when scaling recommendations compete.
    pub priority: TypePriority,
    /// Preferred launch script for worker processes.
    pub spawn_script: String,
    /// Alternate launch script tried once if the preferred one fails.
    pub fallback_script: String,
}

impl AgentTypeConfig {
    pub fn new(agent_type: impl Into<String>) -> Self {
        let agent_type = agent_type.into();
        Self {
            spawn_script: format!("./scripts/run-{agent_type}.sh"),
            fallback_script: "./scripts/run-agent.sh".to_string(),
            agent_type,
            capabilities: Vec::new(),
            primary_capabilities: Vec::new(),
            secondary_capabilities: Vec::new(),
            emergency_capabilities: Vec::new(),
            min_instances: 1,
            max_instances: 4,
            max_concurrency: 5,
            priority: TypePriority::Medium,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tiers<A, B, C>(mut self, primary: A, secondary: B, emergency: C) -> Self
    where
        A: IntoIterator<Item = &'static str>,
        B: IntoIterator<Item = &'static str>,
        C: IntoIterator<Item = &'static str>,
    {
        self.primary_capabilities = primary.into_iter().map(String::from).collect();
        self.secondary_capabilities = secondary.into_iter().map(String::from).collect();
        self.emergency_capabilities = emergency.into_iter().map(String::from).collect();
        self
    }

    pub fn with_instances(mut self, min: usize, max: usize) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn with_priority(mut self, priority: TypePriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Store settings
    /// Redis connection URL shared by all loops and spawned workers.
    pub redis_url: String,

    // Scheduler settings
    /// EMA learning rate for the scheduling model (0 < rate <= 1).
    pub learning_rate: f64,
    /// How often the scheduler re-examines assigned-but-unstarted work.
    pub rebalance_interval: Duration,
    /// Migrations allowed per overloaded agent per rebalance cycle.
    pub max_migrations_per_agent: usize,
    /// How often the learned model is snapshotted to the store.
    pub model_snapshot_interval: Duration,

    // Priority settings
    /// How often escalation rules run over active tasks.
    pub escalation_interval: Duration,

    // Scaling settings
    /// Main auto-scaler analysis cadence.
    pub scaling_interval: Duration,
    /// Queue depth above which a type is overloaded.
    pub scale_up_threshold: usize,
    /// Queue depth below which a type is underutilized.
    pub scale_down_threshold: usize,
    /// Minimum window between scaling actions.
    pub scaling_cooldown: Duration,
    /// Health-monitor cadence.
    pub health_check_interval: Duration,
    /// Heartbeat silence after which an agent is deregistered.
    pub heartbeat_timeout: Duration,
    /// Stuck-task sweep cadence (longer than the scaling interval).
    pub stuck_check_interval: Duration,
    /// Age in a processing list after which a task is considered stuck.
    pub task_processing_timeout: Duration,
    /// Delay between consecutive spawns in one scale-up.
    pub spawn_stagger: Duration,
    /// Backoff before retrying a failed spawn via the fallback script.
    pub spawn_retry_backoff: Duration,
    /// Grace period between SIGTERM and force-kill.
    pub termination_grace: Duration,

    // Balancer settings
    /// Routing cadence (fit-based migrations).
    pub routing_interval: Duration,
    /// Cross-type balancing cadence.
    pub cross_queue_interval: Duration,
    /// Emergency relief cadence (faster than routing).
    pub emergency_interval: Duration,
    /// Failed-task retry cadence.
    pub retry_interval: Duration,
    /// Deviation from mean load marking a type over/underutilized.
    pub cross_queue_threshold: f64,
    /// Combined load above which a type triggers emergency rebalancing.
    pub emergency_threshold: usize,
    /// Retry budget for failed tasks.
    pub max_retries: u32,
    /// Nominal per-agent task capacity used in fit scoring.
    pub max_tasks_per_agent: usize,

    /// Managed agent types.
    pub agent_types: Vec<AgentTypeConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),

            learning_rate: 0.3,
            rebalance_interval: Duration::from_secs(60),
            max_migrations_per_agent: 1,
            model_snapshot_interval: Duration::from_secs(300),

            escalation_interval: Duration::from_secs(60),

            scaling_interval: Duration::from_secs(30),
            scale_up_threshold: 5,
            scale_down_threshold: 2,
            scaling_cooldown: Duration::from_secs(120),
            health_check_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(120),
            stuck_check_interval: Duration::from_secs(300),
            task_processing_timeout: Duration::from_secs(600),
            spawn_stagger: Duration::from_millis(500),
            spawn_retry_backoff: Duration::from_secs(2),
            termination_grace: Duration::from_secs(10),

            routing_interval: Duration::from_secs(30),
            cross_queue_interval: Duration::from_secs(120),
            emergency_interval: Duration::from_secs(15),
            retry_interval: Duration::from_secs(60),
            cross_queue_threshold: 5.0,
            emergency_threshold: 20,
            max_retries: 3,
            max_tasks_per_agent: 10,

            agent_types: default_agent_types(),
        }
    }
}

/// Default agent-type table: a planning/architecture pool, a general
/// backend/API pool, and a code-focused pool.
fn default_agent_types() -> Vec<AgentTypeConfig> {
    vec![
        AgentTypeConfig::new("claude")
            .with_capabilities(["architecture", "refactoring", "documentation", "security"])
            .with_tiers(
                ["architecture", "refactoring", "documentation"],
                ["security", "api"],
                ["backend", "testing"],
            )
            .with_instances(1, 4)
            .with_priority(TypePriority::High),
        AgentTypeConfig::new("gpt")
            .with_capabilities(["backend", "api", "testing", "frontend"])
            .with_tiers(
                ["backend", "api", "frontend"],
                ["testing", "devops"],
                ["documentation", "refactoring"],
            )
            .with_instances(1, 4)
            .with_priority(TypePriority::Medium),
        AgentTypeConfig::new("deepseek-coder")
            .with_capabilities(["debugging", "performance", "backend", "testing"])
            .with_tiers(
                ["debugging", "performance", "testing"],
                ["backend", "api"],
                ["refactoring", "devops"],
            )
            .with_instances(1, 4)
            .with_priority(TypePriority::Medium),
    ]
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `REDIS_URL`: Redis connection URL (default: redis://localhost:6379)
    /// - `AGENTPOOL_LEARNING_RATE`: EMA learning rate (default: 0.3)
    /// - `AGENTPOOL_REBALANCE_INTERVAL_SECS`: Rebalance cadence (default: 60)
    /// - `AGENTPOOL_MAX_MIGRATIONS_PER_AGENT`: Rebalance throttle (default: 1)
    /// - `AGENTPOOL_ESCALATION_INTERVAL_SECS`: Escalation cadence (default: 60)
    /// - `AGENTPOOL_SCALING_INTERVAL_SECS`: Scaler cadence (default: 30)
    /// - `AGENTPOOL_SCALE_UP_THRESHOLD`: Queue depth to scale up (default: 5)
    /// - `AGENTPOOL_SCALE_DOWN_THRESHOLD`: Queue depth to scale down (default: 2)
    /// - `AGENTPOOL_SCALING_COOLDOWN_SECS`: Cooldown window (default: 120)
    /// - `AGENTPOOL_TASK_PROCESSING_TIMEOUT_SECS`: Stuck-task age (default: 600)
    /// - `AGENTPOOL_EMERGENCY_THRESHOLD`: Emergency load (default: 20)
    /// - `AGENTPOOL_MAX_RETRIES`: Failed-task retry budget (default: 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_LEARNING_RATE") {
            config.learning_rate = parse_env_value(&val, "AGENTPOOL_LEARNING_RATE")?;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_REBALANCE_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENTPOOL_REBALANCE_INTERVAL_SECS")?;
            config.rebalance_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTPOOL_MAX_MIGRATIONS_PER_AGENT") {
            config.max_migrations_per_agent =
                parse_env_value(&val, "AGENTPOOL_MAX_MIGRATIONS_PER_AGENT")?;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_ESCALATION_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENTPOOL_ESCALATION_INTERVAL_SECS")?;
            config.escalation_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTPOOL_SCALING_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENTPOOL_SCALING_INTERVAL_SECS")?;
            config.scaling_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTPOOL_SCALE_UP_THRESHOLD") {
            config.scale_up_threshold = parse_env_value(&val, "AGENTPOOL_SCALE_UP_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_SCALE_DOWN_THRESHOLD") {
            config.scale_down_threshold = parse_env_value(&val, "AGENTPOOL_SCALE_DOWN_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_SCALING_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENTPOOL_SCALING_COOLDOWN_SECS")?;
            config.scaling_cooldown = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTPOOL_TASK_PROCESSING_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENTPOOL_TASK_PROCESSING_TIMEOUT_SECS")?;
            config.task_processing_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("AGENTPOOL_EMERGENCY_THRESHOLD") {
            config.emergency_threshold = parse_env_value(&val, "AGENTPOOL_EMERGENCY_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("AGENTPOOL_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "AGENTPOOL_MAX_RETRIES")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "learning_rate must be in (0, 1]".to_string(),
            ));
        }

        if self.scale_up_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "scale_up_threshold must be greater than 0".to_string(),
            ));
        }

        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(ConfigError::ValidationFailed(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }

        if self.max_migrations_per_agent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_migrations_per_agent must be greater than 0".to_string(),
            ));
        }

        if self.max_tasks_per_agent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tasks_per_agent must be greater than 0".to_string(),
            ));
        }

        if self.task_processing_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "task_processing_timeout must be greater than 0".to_string(),
            ));
        }

        if self.agent_types.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one agent type must be configured".to_string(),
            ));
        }

        for type_config in &self.agent_types {
            if type_config.agent_type.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "agent_type name cannot be empty".to_string(),
                ));
            }
            if type_config.min_instances > type_config.max_instances {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent type '{}': min_instances exceeds max_instances",
                    type_config.agent_type
                )));
            }
            if type_config.max_concurrency == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "agent type '{}': max_concurrency must be greater than 0",
                    type_config.agent_type
                )));
            }
        }

        Ok(())
    }

    /// Looks up the configuration for an agent type by name.
    pub fn agent_type(&self, name: &str) -> Option<&AgentTypeConfig> {
        self.agent_types.iter().find(|t| t.agent_type == name)
    }

    /// Builder method to override the redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to replace the agent-type table.
    pub fn with_agent_types(mut self, types: Vec<AgentTypeConfig>) -> Self {
        self.agent_types = types;
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_agent_types() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.agent_types.len(), 3);
        assert!(config.agent_type("claude").is_some());
        assert!(config.agent_type("gpt").is_some());
        assert!(config.agent_type("deepseek-coder").is_some());
        assert!(config.agent_type("unknown").is_none());
    }

    #[test]
    fn test_invalid_learning_rate_rejected() {
        let mut config = OrchestratorConfig::default();
        config.learning_rate = 0.0;
        assert!(config.validate().is_err());

        config.learning_rate = 1.5;
        assert!(config.validate().is_err());

        config.learning_rate = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = OrchestratorConfig::default();
        config.scale_down_threshold = config.scale_up_threshold;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_instance_bounds_enforced() {
        let mut config = OrchestratorConfig::default();
        config.agent_types[0].min_instances = 10;
        config.agent_types[0].max_instances = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_type_priority_ordering() {
        assert!(TypePriority::Critical > TypePriority::High);
        assert!(TypePriority::High > TypePriority::Medium);
        assert!(TypePriority::Medium > TypePriority::Low);
    }

    #[test]
    fn test_type_priority_from_str() {
        assert_eq!(
            "critical".parse::<TypePriority>().unwrap(),
            TypePriority::Critical
        );
        assert!("bogus".parse::<TypePriority>().is_err());
    }
}
