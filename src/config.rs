//! Hierarchical YAML configuration.
//!
//! Layering: `config/main.yaml` ← environment override file selected by
//! `AIWHISPERER_ENV` (`development`, `test`, `production`) ← `local.yaml`.
//! The API key is never stored in files; it comes from `OPENROUTER_API_KEY`
//! and is mandatory whenever a remote model is configured.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_VAR: &str = "AIWHISPERER_ENV";
pub const API_KEY_VAR: &str = "OPENROUTER_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("{API_KEY_VAR} environment variable is required when a remote model is configured")]
    MissingApiKey,
}

/// Sampling and reasoning parameters merged into every request payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// `Some(0)` excludes reasoning tokens entirely; `Some(n)` caps them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reasoning_tokens: Option<u32>,
}

impl GenerationParams {
    /// Per-call overrides win over base values field by field.
    pub fn merged_with(&self, overrides: &GenerationParams) -> GenerationParams {
        GenerationParams {
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            max_reasoning_tokens: overrides.max_reasoning_tokens.or(self.max_reasoning_tokens),
        }
    }
}

/// Retry policy for transient completion failures (rate limits, dropped
/// connections). Tunable from YAML like the other request knobs.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    20_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Fail immediately on any error.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Delay before retry `attempt` (1-indexed): the base delay doubles per
    /// attempt up to the cap, stretched by up to half a step so a fleet of
    /// agents does not retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let stepped_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(stepped_ms).mul_f64(1.0 + rand::random::<f64>() * 0.5)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenRouterConfig {
    pub model: String,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub site_url: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_require_explicit_signal")]
    pub require_explicit_signal: bool,
    #[serde(default = "default_max_continuation_depth")]
    pub max_continuation_depth: usize,
}

fn default_max_iterations() -> usize {
    10
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_require_explicit_signal() -> bool {
    true
}
fn default_max_continuation_depth() -> usize {
    3
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_secs: default_timeout_secs(),
            require_explicit_signal: default_require_explicit_signal(),
            max_continuation_depth: default_max_continuation_depth(),
        }
    }
}

fn default_loop_iterations() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub openrouter: OpenRouterConfig,
    #[serde(default)]
    pub workspace_path: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Per-task model overrides, keyed by agent or task name.
    #[serde(default)]
    pub task_models: HashMap<String, String>,
    #[serde(default)]
    pub task_prompts: HashMap<String, String>,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    /// Hard ceiling on internal loop iterations per session.
    #[serde(default = "default_loop_iterations")]
    pub max_loop_iterations: usize,
    /// Resolved from the environment, never from files.
    #[serde(skip)]
    pub api_key: String,
}

impl Config {
    /// Load the layered configuration rooted at `config_dir`.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let dir = config_dir.as_ref();
        let mut merged = read_yaml(&dir.join("main.yaml"))?;

        if let Ok(env_name) = std::env::var(ENV_VAR) {
            let override_path = dir.join(format!("{env_name}.yaml"));
            if override_path.exists() {
                debug!(env = %env_name, "applying environment override config");
                let overlay = read_yaml(&override_path)?;
                merge_yaml(&mut merged, overlay);
            }
        }

        let local_path = dir.join("local.yaml");
        if local_path.exists() {
            let overlay = read_yaml(&local_path)?;
            merge_yaml(&mut merged, overlay);
        }

        let mut config: Config = serde_yaml::from_value(merged).map_err(|source| {
            ConfigError::Parse {
                path: dir.join("main.yaml").display().to_string(),
                source,
            }
        })?;
        config.validate()?;

        config.api_key = std::env::var(API_KEY_VAR).map_err(|_| ConfigError::MissingApiKey)?;
        Ok(config)
    }

    /// Validation independent of the environment (used by tests that build
    /// configs by hand).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.openrouter.model.trim().is_empty() {
            return Err(ConfigError::Invalid("openrouter.model must be set".into()));
        }
        Ok(())
    }

    /// Model for a named task, falling back to the default model.
    pub fn model_for_task(&self, task: &str) -> &str {
        self.task_models
            .get(task)
            .map(String::as_str)
            .unwrap_or(&self.openrouter.model)
    }
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Recursive mapping merge: overlay wins on scalars and sequences, mappings
/// merge key by key.
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn local_overrides_main() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            "main.yaml",
            "openrouter:\n  model: openai/gpt-4o\n  params:\n    temperature: 0.7\n",
        );
        write_config(
            dir.path(),
            "local.yaml",
            "openrouter:\n  params:\n    temperature: 0.2\n",
        );

        let mut base = read_yaml(&dir.path().join("main.yaml")).unwrap();
        let overlay = read_yaml(&dir.path().join("local.yaml")).unwrap();
        merge_yaml(&mut base, overlay);
        let config: Config = serde_yaml::from_value(base).unwrap();

        assert_eq!(config.openrouter.model, "openai/gpt-4o");
        assert_eq!(config.openrouter.params.temperature, Some(0.2));
    }

    #[test]
    fn missing_model_is_invalid() {
        let yaml = "openrouter:\n  model: \"\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn defaults_are_applied() {
        let yaml = "openrouter:\n  model: openai/gpt-4o\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_loop_iterations, 1000);
        assert_eq!(config.continuation.max_iterations, 10);
        assert_eq!(config.continuation.timeout_secs, 300);
        assert!(config.continuation.require_explicit_signal);
    }

    #[test]
    fn task_model_fallback() {
        let yaml =
            "openrouter:\n  model: openai/gpt-4o\ntask_models:\n  debugger: anthropic/claude-sonnet-4\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.model_for_task("debugger"), "anthropic/claude-sonnet-4");
        assert_eq!(config.model_for_task("planner"), "openai/gpt-4o");
    }

    #[test]
    fn retry_policy_defaults_and_overrides() {
        let yaml = "openrouter:\n  model: openai/gpt-4o\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.openrouter.retry, RetryPolicy::default());

        let yaml = "openrouter:\n  model: openai/gpt-4o\n  retry:\n    max_attempts: 1\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.openrouter.retry.max_attempts, 1);
        assert_eq!(config.openrouter.retry.base_delay_ms, 500);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 20_000,
        };
        // Attempt 1 waits one base step, stretched by at most half a step.
        let first = policy.backoff(1).as_millis() as u64;
        assert!((500..=750).contains(&first), "got {first}");
        let second = policy.backoff(2).as_millis() as u64;
        assert!((1000..=1500).contains(&second), "got {second}");
        // Far attempts stay at the cap (plus spread).
        let late = policy.backoff(30).as_millis() as u64;
        assert!((20_000..=30_000).contains(&late), "got {late}");
    }

    #[test]
    fn params_merge_prefers_overrides() {
        let base = GenerationParams {
            temperature: Some(0.7),
            max_tokens: Some(4096),
            max_reasoning_tokens: None,
        };
        let overrides = GenerationParams {
            temperature: Some(0.1),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.temperature, Some(0.1));
        assert_eq!(merged.max_tokens, Some(4096));
    }
}
