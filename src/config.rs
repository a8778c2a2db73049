use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the orchestrator
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowOrchestratorConfig {
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Read-through cache settings
    pub cache: CacheConfig,
    /// Run deadlines and retry policy
    pub orchestration: OrchestrationConfig,
    /// Outbound notification settings
    pub notifications: NotificationConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level or filter directive
    pub log_level: String,
    /// Emit JSON formatted logs
    pub json_logs: bool,
    /// Periodically log orchestration counters
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub process_instance_ttl_seconds: u64,
    pub task_instance_ttl_seconds: u64,
    pub process_event_ttl_seconds: u64,
    pub process_events_ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    /// How long a process run waits for its `complete` signal
    pub process_deadline_seconds: u64,
    /// How long a task run waits for its `task_complete` signal
    pub task_deadline_seconds: u64,
    /// Buffered signals per run channel
    pub signal_buffer: usize,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Upper bound on notifications dispatched per second
    pub per_second: u32,
    /// Burst allowance on top of the steady rate
    pub burst: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl Default for WorkflowOrchestratorConfig {
    fn default() -> Self {
        Self {
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                json_logs: true,
                metrics_enabled: true,
            },
            cache: CacheConfig {
                max_capacity: 10_000,
                process_instance_ttl_seconds: 30 * 60,
                task_instance_ttl_seconds: 15 * 60,
                process_event_ttl_seconds: 60 * 60,
                process_events_ttl_seconds: 30 * 60,
            },
            orchestration: OrchestrationConfig {
                process_deadline_seconds: 24 * 60 * 60,
                task_deadline_seconds: 72 * 60 * 60,
                signal_buffer: 64,
                retry: RetryConfig::default(),
            },
            notifications: NotificationConfig {
                per_second: 50,
                burst: 100,
            },
            database: None,
        }
    }
}

impl OrchestrationConfig {
    pub fn process_deadline(&self) -> Duration {
        Duration::from_secs(self.process_deadline_seconds)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_seconds)
    }
}

impl WorkflowOrchestratorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (workflow-orchestrator.toml, .workflow-orchestrator-rc)
    /// 3. Environment variables (prefixed with WORKFLOW_ORCHESTRATOR_)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) with config files resolved relative to `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let primary = dir.join("workflow-orchestrator.toml");
        if primary.exists() {
            builder = builder.add_source(File::from(primary));
        }

        let rc = dir.join(".workflow-orchestrator-rc");
        if rc.exists() {
            builder = builder.add_source(File::from(rc).format(config::FileFormat::Toml));
        }

        // Nested keys use a double underscore, e.g. WORKFLOW_ORCHESTRATOR_CACHE__MAX_CAPACITY
        builder = builder.add_source(
            Environment::with_prefix("WORKFLOW_ORCHESTRATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let loaded: WorkflowOrchestratorConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestration.process_deadline_seconds == 0 {
            anyhow::bail!("orchestration.process_deadline_seconds must be positive");
        }
        if self.orchestration.task_deadline_seconds == 0 {
            anyhow::bail!("orchestration.task_deadline_seconds must be positive");
        }
        if self.orchestration.signal_buffer == 0 {
            anyhow::bail!("orchestration.signal_buffer must be positive");
        }
        if self.notifications.per_second == 0 {
            anyhow::bail!("notifications.per_second must be positive");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<WorkflowOrchestratorConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = WorkflowOrchestratorConfig::load_env_file();
        WorkflowOrchestratorConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static WorkflowOrchestratorConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
