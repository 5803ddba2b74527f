//! Configuration management for autodebug.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Optional. API key for LLM-backed agents and embeddings.
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `MAX_ITERATIONS` - Optional. Maximum fix iterations per task. Defaults to `5`.
//! - `AGENT_TIMEOUT_SECS` - Optional. Per-agent-call timeout. Defaults to `300`.
//! - `ENABLE_CRITIC` / `ENABLE_REVIEWER` - Optional. Stage toggles. Default `true`.
//! - `SANDBOX_CPU_LIMIT_SECS` - Optional. CPU seconds per execution. Defaults to `60`.
//! - `SANDBOX_MEMORY_LIMIT_MB` - Optional. Address-space limit. Defaults to `512`.
//! - `SANDBOX_TIMEOUT_SECS` - Optional. Wall-clock limit per execution. Defaults to `120`.
//! - `SANDBOX_MAX_PROCESSES` - Optional. Process count limit. Defaults to `100`.
//! - `SANDBOX_MAX_CONCURRENT` - Optional. System-wide admission limit. Defaults to `4`.
//! - `SANDBOX_EXEC_ROOT` - Optional. Root for ephemeral execution dirs.
//! - `MEMORY_DB_PATH` - Optional. SQLite path for the solution memory.
//! - `MEMORY_EMBED_MODEL` - Optional. Embedding model. Defaults to `openai/text-embedding-3-small`.
//! - `PLANNER_MODEL`, `LOCATOR_MODEL`, `CODER_MODEL`, `CRITIC_MODEL`, `REVIEWER_MODEL` -
//!   Optional per-role model overrides.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

const DEFAULT_MODEL: &str = "openai/gpt-5-mini";

/// Models assigned to the LLM-backed agent roles.
///
/// The executor role runs the sandbox and has no model.
#[derive(Debug, Clone)]
pub struct RoleModels {
    pub planner: String,
    pub locator: String,
    pub coder: String,
    pub critic: String,
    pub reviewer: String,
}

impl Default for RoleModels {
    fn default() -> Self {
        Self {
            planner: DEFAULT_MODEL.to_string(),
            locator: DEFAULT_MODEL.to_string(),
            coder: DEFAULT_MODEL.to_string(),
            critic: DEFAULT_MODEL.to_string(),
            reviewer: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Resource limits and pooling for the execution sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// CPU seconds per execution (RLIMIT_CPU)
    pub cpu_limit_secs: u64,

    /// Address-space limit in megabytes (RLIMIT_AS)
    pub memory_limit_mb: u64,

    /// Wall-clock timeout per execution
    pub timeout_secs: u64,

    /// Maximum process count (RLIMIT_NPROC)
    pub max_processes: u32,

    /// System-wide cap on concurrent executions
    pub max_concurrent: usize,

    /// Root directory for ephemeral execution dirs
    pub exec_root: PathBuf,

    /// Byte cap for captured stdout/stderr
    pub output_cap_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_limit_secs: 60,
            memory_limit_mb: 512,
            timeout_secs: 120,
            max_processes: 100,
            max_concurrent: 4,
            exec_root: std::env::temp_dir().join("autodebug-exec"),
            output_cap_bytes: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Solution memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Whether the memory subsystem is enabled
    pub enabled: bool,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Embedding model for similarity keys
    pub embed_model: String,

    /// Embedding dimension (must match model output)
    pub embed_dimension: usize,

    /// Upper bound on how long retrieval may block a task
    pub retrieve_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from("autodebug-memory.db"),
            embed_model: "openai/text-embedding-3-small".to_string(),
            embed_dimension: 1536,
            retrieve_timeout_ms: 2_000,
        }
    }
}

impl MemoryConfig {
    pub fn retrieve_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieve_timeout_ms)
    }
}

/// Immutable orchestrator configuration.
///
/// Constructed once (per process from the environment, or per task via
/// [`Config::with_overrides`]) and passed by reference; there is no ambient
/// mutable settings state.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key, if configured
    pub api_key: Option<String>,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Maximum fix iterations per task (>= 1)
    pub max_iterations: u32,

    /// Per-agent-call timeout in seconds
    pub agent_timeout_secs: u64,

    /// Whether the critic stage is routed
    pub enable_critic: bool,

    /// Whether the reviewer stage is routed
    pub enable_reviewer: bool,

    /// Per-role model assignment
    pub models: RoleModels,

    /// Sandbox limits and pooling
    pub sandbox: SandboxConfig,

    /// Solution memory configuration
    pub memory: MemoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_iterations: 5,
            agent_timeout_secs: 300,
            enable_critic: true,
            enable_reviewer: true,
            models: RoleModels::default(),
            sandbox: SandboxConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                other.to_string(),
            )),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable values or
    /// `MAX_ITERATIONS < 1`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let max_iterations = env_parse("MAX_ITERATIONS", defaults.max_iterations)?;
        if max_iterations < 1 {
            return Err(ConfigError::InvalidValue(
                "MAX_ITERATIONS".to_string(),
                "must be >= 1".to_string(),
            ));
        }

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let role_model = |var: &str| std::env::var(var).unwrap_or_else(|_| default_model.clone());

        let sandbox = SandboxConfig {
            cpu_limit_secs: env_parse("SANDBOX_CPU_LIMIT_SECS", defaults.sandbox.cpu_limit_secs)?,
            memory_limit_mb: env_parse(
                "SANDBOX_MEMORY_LIMIT_MB",
                defaults.sandbox.memory_limit_mb,
            )?,
            timeout_secs: env_parse("SANDBOX_TIMEOUT_SECS", defaults.sandbox.timeout_secs)?,
            max_processes: env_parse("SANDBOX_MAX_PROCESSES", defaults.sandbox.max_processes)?,
            max_concurrent: env_parse("SANDBOX_MAX_CONCURRENT", defaults.sandbox.max_concurrent)?,
            exec_root: std::env::var("SANDBOX_EXEC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.sandbox.exec_root),
            output_cap_bytes: defaults.sandbox.output_cap_bytes,
        };

        let memory = MemoryConfig {
            enabled: env_bool("ENABLE_MEMORY", defaults.memory.enabled)?,
            db_path: std::env::var("MEMORY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.memory.db_path),
            embed_model: std::env::var("MEMORY_EMBED_MODEL").unwrap_or(defaults.memory.embed_model),
            embed_dimension: defaults.memory.embed_dimension,
            retrieve_timeout_ms: env_parse(
                "MEMORY_RETRIEVE_TIMEOUT_MS",
                defaults.memory.retrieve_timeout_ms,
            )?,
        };

        Ok(Self {
            api_key: std::env::var("OPENROUTER_API_KEY").ok(),
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port)?,
            max_iterations,
            agent_timeout_secs: env_parse("AGENT_TIMEOUT_SECS", defaults.agent_timeout_secs)?,
            enable_critic: env_bool("ENABLE_CRITIC", defaults.enable_critic)?,
            enable_reviewer: env_bool("ENABLE_REVIEWER", defaults.enable_reviewer)?,
            models: RoleModels {
                planner: role_model("PLANNER_MODEL"),
                locator: role_model("LOCATOR_MODEL"),
                coder: role_model("CODER_MODEL"),
                critic: role_model("CRITIC_MODEL"),
                reviewer: role_model("REVIEWER_MODEL"),
            },
            sandbox,
            memory,
        })
    }

    /// Per-agent-call timeout as a `Duration`.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Derive a per-task configuration from submission overrides.
    ///
    /// Absent override fields keep the base value. Override values are
    /// validated the same way as environment values.
    pub fn with_overrides(&self, overrides: &TaskOverrides) -> Result<Config, ConfigError> {
        let mut config = self.clone();

        if let Some(max) = overrides.max_iterations {
            if max < 1 {
                return Err(ConfigError::InvalidValue(
                    "max_iterations".to_string(),
                    "must be >= 1".to_string(),
                ));
            }
            config.max_iterations = max;
        }
        if let Some(secs) = overrides.agent_timeout_secs {
            config.agent_timeout_secs = secs;
        }
        if let Some(v) = overrides.enable_critic {
            config.enable_critic = v;
        }
        if let Some(v) = overrides.enable_reviewer {
            config.enable_reviewer = v;
        }
        if let Some(v) = overrides.sandbox_cpu_limit_secs {
            config.sandbox.cpu_limit_secs = v;
        }
        if let Some(v) = overrides.sandbox_memory_limit_mb {
            config.sandbox.memory_limit_mb = v;
        }
        if let Some(v) = overrides.sandbox_timeout_secs {
            config.sandbox.timeout_secs = v;
        }
        if let Some(v) = overrides.sandbox_max_processes {
            config.sandbox.max_processes = v;
        }

        Ok(config)
    }
}

/// Per-task configuration overrides accepted at submission time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskOverrides {
    pub max_iterations: Option<u32>,
    pub agent_timeout_secs: Option<u64>,
    pub enable_critic: Option<bool>,
    pub enable_reviewer: Option<bool>,
    pub sandbox_cpu_limit_secs: Option<u64>,
    pub sandbox_memory_limit_mb: Option<u64>,
    pub sandbox_timeout_secs: Option<u64>,
    pub sandbox_max_processes: Option<u32>,
}
