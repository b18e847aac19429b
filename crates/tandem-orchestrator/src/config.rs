// Orchestrator Configuration
// Per-run caps and toggles, plus the layered loader used by the CLI and registry

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OrchestratorError, Result};

/// Upper bound on extra validator-driven fix attempts per task
pub const MAX_FIX_LOOP_ATTEMPTS: u32 = 3;

const ENV_PREFIX: &str = "TANDEM_ORCH_";

/// What a settled run with failed or blocked tasks resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Any Failed or Blocked task fails the run
    #[default]
    FailOnAnyFailure,
    /// The run completes if at least one task reached Done
    CompleteIfAnySucceeded,
}

/// Configuration for an orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum total planning + execution iterations
    pub max_iterations: u32,
    /// Maximum total tokens (estimated if metering unavailable)
    pub max_total_tokens: u64,
    /// Maximum tokens per sub-agent call
    pub max_tokens_per_step: u64,
    /// Maximum wall time in seconds
    pub max_wall_time_secs: u64,
    /// Maximum sub-agent invocations
    pub max_subagent_runs: u32,
    /// Maximum retries per task before fail-block
    pub max_task_retries: u32,
    /// Maximum tasks the planner may produce
    pub max_tasks: usize,
    pub max_parallel_tasks: u32,
    pub llm_parallel: u32,
    pub fs_write_parallel: u32,
    pub shell_parallel: u32,
    /// Require approval before writing files
    pub require_write_approval: bool,
    /// Enable dangerous actions (shell, install, network, push); still approval-gated
    pub allow_dangerous_actions: bool,
    /// Enable research/web agent
    pub enable_research: bool,
    /// Approval-required actions are staged for batch review instead of failing the attempt
    pub staged_mode: bool,
    pub fix_loop_attempts: u32,
    pub fix_loop_token_budget: u64,
    pub max_response_tokens: u64,
    pub agent_timeout_secs: u64,
    /// Fraction of a cap at which `budget.warning` fires
    pub budget_warning_threshold: f64,
    pub completion_policy: CompletionPolicy,
    pub strict_planner_json: bool,
    pub allow_prose_fallback: bool,
    /// Names looked up in the secret store and scrubbed from prompts
    pub secret_names: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            max_total_tokens: 400_000,
            max_tokens_per_step: 60_000,
            max_wall_time_secs: 60 * 60,
            max_subagent_runs: 500,
            max_task_retries: 3,
            max_tasks: 12,
            max_parallel_tasks: 4,
            llm_parallel: 3,
            fs_write_parallel: 1,
            shell_parallel: 1,
            require_write_approval: true,
            allow_dangerous_actions: false,
            enable_research: false,
            staged_mode: true,
            fix_loop_attempts: 0,
            fix_loop_token_budget: 20_000,
            max_response_tokens: 4096,
            agent_timeout_secs: 300,
            budget_warning_threshold: 0.8,
            completion_policy: CompletionPolicy::FailOnAnyFailure,
            strict_planner_json: true,
            allow_prose_fallback: true,
            secret_names: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let caps: [(&str, u64); 10] = [
            ("max_iterations", self.max_iterations as u64),
            ("max_total_tokens", self.max_total_tokens),
            ("max_tokens_per_step", self.max_tokens_per_step),
            ("max_wall_time_secs", self.max_wall_time_secs),
            ("max_subagent_runs", self.max_subagent_runs as u64),
            ("max_tasks", self.max_tasks as u64),
            ("max_parallel_tasks", self.max_parallel_tasks as u64),
            ("llm_parallel", self.llm_parallel as u64),
            ("fs_write_parallel", self.fs_write_parallel as u64),
            ("shell_parallel", self.shell_parallel as u64),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        if self.agent_timeout_secs == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "agent_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if !(self.budget_warning_threshold > 0.0 && self.budget_warning_threshold <= 1.0) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "budget_warning_threshold must be in (0, 1], got {}",
                self.budget_warning_threshold
            )));
        }
        Ok(())
    }

    pub fn effective_fix_loop_attempts(&self) -> u32 {
        self.fix_loop_attempts.min(MAX_FIX_LOOP_ATTEMPTS)
    }
}

// ============================================================================
// Layered loading
// ============================================================================

/// Builds an [`OrchestratorConfig`] from defaults, an optional file, the
/// environment and explicit overrides. Later layers win.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    file_layer: Option<Value>,
    env_layer: Option<Value>,
    override_layer: Option<Value>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a JSON or YAML config file (chosen by extension)
    pub fn with_file(mut self, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml"))
            .unwrap_or(false);
        let value: Value = if is_yaml {
            serde_yaml::from_str(&raw)?
        } else {
            serde_json::from_str(&raw)?
        };
        if !value.is_object() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{} must contain a mapping at the top level",
                path.display()
            )));
        }
        self.file_layer = Some(value);
        Ok(self)
    }

    /// Pick up `TANDEM_ORCH_<FIELD>` variables from the process environment
    pub fn with_env(self) -> Self {
        self.with_env_vars(std::env::vars())
    }

    pub fn with_env_vars<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let layer = env_layer(vars);
        if layer.as_object().is_some_and(|m| !m.is_empty()) {
            self.env_layer = Some(layer);
        }
        self
    }

    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.override_layer = Some(overrides);
        self
    }

    pub fn load(self) -> Result<OrchestratorConfig> {
        let mut merged = serde_json::to_value(OrchestratorConfig::default())?;
        for layer in [self.file_layer, self.env_layer, self.override_layer]
            .into_iter()
            .flatten()
        {
            deep_merge(&mut merged, &layer);
        }
        let config: OrchestratorConfig = serde_json::from_value(merged)
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn env_layer<I>(vars: I) -> Value
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut map = Map::new();
    for (key, raw) in vars {
        let Some(field) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let field = field.to_ascii_lowercase();
        let raw = raw.trim();
        let value = if field == "secret_names" {
            Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )
        } else {
            parse_env_scalar(raw)
        };
        map.insert(field, value);
    }
    Value::Object(map)
}

fn parse_env_scalar(raw: &str) -> Value {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => return Value::Bool(true),
        "false" | "no" | "off" => return Value::Bool(false),
        _ => {}
    }
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| v.is_number())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_caps() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_iterations, 200);
        assert_eq!(config.max_total_tokens, 400_000);
        assert_eq!(config.max_tokens_per_step, 60_000);
        assert_eq!(config.max_wall_time_secs, 3600);
        assert_eq!(config.max_subagent_runs, 500);
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.max_tasks, 12);
        assert_eq!(config.max_parallel_tasks, 4);
        assert_eq!(config.llm_parallel, 3);
        assert_eq!(config.fs_write_parallel, 1);
        assert_eq!(config.shell_parallel, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fix_loop_is_clamped() {
        let config = OrchestratorConfig {
            fix_loop_attempts: 10,
            ..Default::default()
        };
        assert_eq!(config.effective_fix_loop_attempts(), MAX_FIX_LOOP_ATTEMPTS);
    }

    #[test]
    fn layers_apply_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orch.yaml");
        std::fs::write(&path, "max_parallel_tasks: 2\nmax_total_tokens: 5000\n").unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .unwrap()
            .with_env_vars(vec![
                ("TANDEM_ORCH_MAX_TOTAL_TOKENS".to_string(), "7000".to_string()),
                ("TANDEM_ORCH_ALLOW_DANGEROUS_ACTIONS".to_string(), "yes".to_string()),
                ("TANDEM_ORCH_SECRET_NAMES".to_string(), "OPENAI_API_KEY, GH_TOKEN".to_string()),
                ("UNRELATED".to_string(), "1".to_string()),
            ])
            .with_overrides(json!({ "completion_policy": "complete_if_any_succeeded" }))
            .load()
            .unwrap();

        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.max_total_tokens, 7000);
        assert!(config.allow_dangerous_actions);
        assert_eq!(config.secret_names, vec!["OPENAI_API_KEY", "GH_TOKEN"]);
        assert_eq!(
            config.completion_policy,
            CompletionPolicy::CompleteIfAnySucceeded
        );
        // untouched fields keep defaults
        assert_eq!(config.llm_parallel, 3);
    }

    #[test]
    fn zero_caps_are_rejected() {
        let err = ConfigLoader::new()
            .with_overrides(json!({ "max_parallel_tasks": 0 }))
            .load()
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidConfig(_)));
    }

    #[test]
    fn warning_threshold_must_be_a_fraction() {
        let config = OrchestratorConfig {
            budget_warning_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_config_deserializes_with_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(r#"{"max_tasks": 3}"#).unwrap();
        assert_eq!(config.max_tasks, 3);
        assert!(config.require_write_approval);
    }
}
