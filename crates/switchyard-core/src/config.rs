//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchyardError};

/// Top-level Switchyard configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentDefaults>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail: Option<GuardrailConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metering: Option<MeteringConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<NotesConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Reasoning budget in tokens. Unset disables extended thinking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget_tokens: Option<u32>,

    /// Upper bound on model rounds per turn. Unset means no bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,

    /// Stream provider output (default: true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

// --- Providers and model catalog ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<Vec<ModelConfig>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Converse-compatible HTTP endpoint with an NDJSON event stream.
    #[default]
    Converse,
    /// Anthropic Messages API.
    Anthropic,
    /// Scripted offline backend.
    Mock,
}

/// Configuration for a single inference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Request timeout in seconds (default: 300).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(300)
    }
}

/// Size class used to pick the prompt-cache granule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Large,
    Standard,
    Compact,
}

/// Per-1000-token prices in the billing currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
    #[serde(default)]
    pub cache_read_per_1k: f64,
    #[serde(default)]
    pub cache_write_per_1k: f64,
}

/// A model that callers may select.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Public model id used by callers.
    pub id: String,

    /// Provider id serving this model.
    pub provider: String,

    /// Backend model identifier, when it differs from `id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reasoning_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u32>,

    #[serde(default = "default_true")]
    pub supports_cache: bool,

    #[serde(default)]
    pub pricing: ModelPricing,
}

impl ModelConfig {
    pub fn backend_model_id(&self) -> &str {
        self.internal_name.as_deref().unwrap_or(&self.id)
    }
}

fn default_true() -> bool {
    true
}

// --- Prompt cache ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Message cache markers kept per request (default: 2).
    #[serde(default = "default_max_markers")]
    pub max_markers: usize,

    /// Largest cache boundary in tokens (default: 1,000,000).
    #[serde(default = "default_ceiling_tokens")]
    pub ceiling_tokens: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_markers: default_max_markers(),
            ceiling_tokens: default_ceiling_tokens(),
        }
    }
}

fn default_max_markers() -> usize {
    2
}

fn default_ceiling_tokens() -> u64 {
    1_000_000
}

// --- Guardrails ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailMode {
    /// Screening configuration rides along with the inference call.
    #[default]
    Inline,
    /// A separate screening call runs before inference.
    Standalone,
    /// Local term list, screened before inference.
    DenyList,
}

/// Price per policy unit, by assessment category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuardrailPricing {
    #[serde(default = "default_content_unit_price")]
    pub content_policy_unit: f64,
    #[serde(default = "default_topic_unit_price")]
    pub topic_policy_unit: f64,
    #[serde(default = "default_sensitive_unit_price")]
    pub sensitive_information_policy_unit: f64,
    #[serde(default = "default_grounding_unit_price")]
    pub contextual_grounding_policy_unit: f64,
}

impl Default for GuardrailPricing {
    fn default() -> Self {
        Self {
            content_policy_unit: default_content_unit_price(),
            topic_policy_unit: default_topic_unit_price(),
            sensitive_information_policy_unit: default_sensitive_unit_price(),
            contextual_grounding_policy_unit: default_grounding_unit_price(),
        }
    }
}

fn default_content_unit_price() -> f64 {
    0.000_15
}

fn default_topic_unit_price() -> f64 {
    0.000_15
}

fn default_sensitive_unit_price() -> f64 {
    0.000_10
}

fn default_grounding_unit_price() -> f64 {
    0.000_10
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub mode: GuardrailMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Base URL of the screening service (standalone mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Blocked terms (deny_list mode).
    #[serde(default)]
    pub terms: Vec<String>,

    #[serde(default)]
    pub pricing: GuardrailPricing,
}

impl GuardrailConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or("DRAFT")
    }
}

// --- Metering ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStoreKind {
    #[default]
    Memory,
    Jsonl,
}

/// Budget assigned to a user when the store has no record of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBudgetSeed {
    pub user_id: String,
    /// Budget per reset period. Unset means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeteringConfig {
    #[serde(default)]
    pub store: UsageStoreKind,

    /// Directory for the jsonl store (default: `~/.switchyard/usage`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default)]
    pub users: Vec<UserBudgetSeed>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotesConfig {
    /// Notes storage directory (default: `~/.switchyard/notes`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Expose `/metrics` in Prometheus format.
    #[serde(default)]
    pub metrics: bool,
}

fn default_port() -> u16 {
    8686
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "switchyard_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid")
    });
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

fn expand_dir(dir: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(dir).as_ref())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text in JSON5 form.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| SwitchyardError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_deref())
            .unwrap_or(&[])
    }

    pub fn catalog(&self) -> &[ModelConfig] {
        self.models
            .as_ref()
            .and_then(|m| m.catalog.as_deref())
            .unwrap_or(&[])
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers().iter().find(|p| p.id == id)
    }

    /// Find a catalog model by public id.
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.catalog().iter().find(|m| m.id == id)
    }

    /// Default model: the configured one, else the first catalog entry.
    pub fn default_model(&self) -> Option<String> {
        self.agent
            .as_ref()
            .and_then(|a| a.model.clone())
            .or_else(|| self.catalog().first().map(|m| m.id.clone()))
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.system_prompt.as_deref())
    }

    /// Get the default max_tokens.
    pub fn max_tokens(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tokens)
            .unwrap_or(4096)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent.as_ref().and_then(|a| a.temperature)
    }

    pub fn thinking_budget_tokens(&self) -> Option<u32> {
        self.agent.as_ref().and_then(|a| a.thinking_budget_tokens)
    }

    pub fn max_rounds(&self) -> Option<u32> {
        self.agent.as_ref().and_then(|a| a.max_rounds)
    }

    pub fn stream(&self) -> bool {
        self.agent.as_ref().and_then(|a| a.stream).unwrap_or(true)
    }

    pub fn cache(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(8686)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".into())
    }

    pub fn metrics_enabled(&self) -> bool {
        self.gateway.as_ref().is_some_and(|g| g.metrics)
    }

    pub fn usage_dir(&self) -> PathBuf {
        self.metering
            .as_ref()
            .and_then(|m| m.dir.as_deref())
            .map(expand_dir)
            .unwrap_or_else(|| data_dir().join("usage"))
    }

    pub fn notes_dir(&self) -> PathBuf {
        self.notes
            .as_ref()
            .and_then(|n| n.dir.as_deref())
            .map(expand_dir)
            .unwrap_or_else(|| data_dir().join("notes"))
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "cache.max_markers").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for p in self.providers() {
            if p.kind != ProviderKind::Mock && p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
            if p.kind != ProviderKind::Mock && p.base_url.is_none() {
                warnings.push(format!(
                    "Provider '{}' has no base_url; the default endpoint will be used",
                    p.id
                ));
            }
        }

        for m in self.catalog() {
            if self.provider(&m.provider).is_none() {
                errors.push(format!(
                    "Model '{}' references unknown provider '{}'",
                    m.id, m.provider
                ));
            }
            let p = &m.pricing;
            if p.input_per_1k < 0.0
                || p.output_per_1k < 0.0
                || p.cache_read_per_1k < 0.0
                || p.cache_write_per_1k < 0.0
            {
                errors.push(format!("Model '{}' has a negative price", m.id));
            }
        }

        if let Some(model) = self.agent.as_ref().and_then(|a| a.model.as_deref()) {
            if self.model(model).is_none() {
                errors.push(format!("Default model '{model}' is not in the catalog"));
            }
        }

        if self.cache.as_ref().is_some_and(|c| c.enabled && c.max_markers == 0) {
            warnings.push("cache.max_markers is 0; only system and tool caching apply".into());
        }

        if let Some(g) = &self.guardrail {
            match g.mode {
                GuardrailMode::Standalone if g.endpoint.is_none() => {
                    errors.push("Standalone guardrail requires an endpoint".into());
                }
                GuardrailMode::Inline | GuardrailMode::Standalone if g.identifier.is_none() => {
                    errors.push("Guardrail identifier is required".into());
                }
                GuardrailMode::DenyList if g.terms.is_empty() => {
                    warnings.push("Deny-list guardrail has no terms and will allow everything".into());
                }
                _ => {}
            }
            let p = &g.pricing;
            if p.content_policy_unit < 0.0
                || p.topic_policy_unit < 0.0
                || p.sensitive_information_policy_unit < 0.0
                || p.contextual_grounding_policy_unit < 0.0
            {
                errors.push("Guardrail pricing has a negative unit price".into());
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Switchyard data: `~/.switchyard/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        // JSON5 allows comments
        models: {
            providers: [
                { id: "primary", kind: "converse", base_url: "https://inference.example.com", api_key: "k" },
                { id: "offline", kind: "mock" },
            ],
            catalog: [
                {
                    id: "sonnet",
                    provider: "primary",
                    internal_name: "anthropic.claude-sonnet-4",
                    max_output_tokens: 8192,
                    pricing: { input_per_1k: 0.003, output_per_1k: 0.015, cache_read_per_1k: 0.0003, cache_write_per_1k: 0.00375 },
                },
                { id: "echo", provider: "offline", tier: "compact", supports_cache: false },
            ],
        },
        agent: { model: "sonnet", max_rounds: 8 },
        cache: { max_markers: 3 },
        guardrail: { mode: "deny_list", terms: ["forbidden"] },
        metering: { store: "jsonl", users: [{ user_id: "alice", budget: 5.0 }, { user_id: "ops" }] },
    }"#;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SY_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_SY_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SY_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_SY_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 8686);
        assert_eq!(config.max_tokens(), 4096);
        assert_eq!(config.max_rounds(), None);
        assert!(config.stream());
        assert_eq!(config.cache().max_markers, 2);
        assert_eq!(config.cache().ceiling_tokens, 1_000_000);
        assert!(config.default_model().is_none());
    }

    #[test]
    fn test_sample_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.providers().len(), 2);
        assert_eq!(config.provider("offline").unwrap().kind, ProviderKind::Mock);

        let sonnet = config.model("sonnet").unwrap();
        assert_eq!(sonnet.backend_model_id(), "anthropic.claude-sonnet-4");
        assert!(sonnet.supports_cache);
        assert_eq!(sonnet.pricing.output_per_1k, 0.015);

        let echo = config.model("echo").unwrap();
        assert_eq!(echo.backend_model_id(), "echo");
        assert_eq!(echo.tier, Some(ModelTier::Compact));
        assert!(!echo.supports_cache);

        assert_eq!(config.default_model().as_deref(), Some("sonnet"));
        assert_eq!(config.max_rounds(), Some(8));
        assert_eq!(config.cache().max_markers, 3);
        assert!(config.cache().enabled);

        let metering = config.metering.as_ref().unwrap();
        assert_eq!(metering.store, UsageStoreKind::Jsonl);
        assert_eq!(metering.users[0].budget, Some(5.0));
        assert_eq!(metering.users[1].budget, None);

        let (warnings, errors) = config.validate();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    #[test]
    fn test_get_path() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(
            config.get_path("cache.max_markers"),
            Some(serde_json::json!(3))
        );
        assert_eq!(config.get_path("gateway.port"), None);
    }

    #[test]
    fn test_guardrail_pricing_defaults() {
        let config = Config::parse(r#"{ guardrail: { mode: "inline", identifier: "gr-1" } }"#).unwrap();
        let g = config.guardrail.unwrap();
        assert_eq!(g.version(), "DRAFT");
        assert_eq!(g.pricing, GuardrailPricing::default());
        assert!(g.pricing.content_policy_unit > 0.0);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_unknown_provider_errors() {
        let config = Config::parse(
            r#"{ models: { catalog: [{ id: "m", provider: "nowhere" }] }, agent: { model: "other" } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("nowhere")), "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("other")), "{errors:?}");
    }

    #[test]
    fn test_validate_missing_api_key_warns() {
        let config = Config::parse(r#"{ models: { providers: [{ id: "primary" }] } }"#).unwrap();
        let (warnings, _errors) = config.validate();
        assert!(
            warnings
                .iter()
                .any(|w| w.contains("primary") && w.to_lowercase().contains("key")),
            "Expected a warning about missing API key, got: {warnings:?}"
        );
    }

    #[test]
    fn test_validate_standalone_needs_endpoint() {
        let config =
            Config::parse(r#"{ guardrail: { mode: "standalone", identifier: "gr" } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("endpoint")));
    }

    #[test]
    fn test_validate_negative_guardrail_price_errors() {
        let config = Config::parse(
            r#"{ guardrail: { mode: "deny_list", terms: ["x"], pricing: { topic_policy_unit: -1.0 } } }"#,
        )
        .unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("negative unit price")), "{errors:?}");
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.models.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::parse(SAMPLE).unwrap();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.catalog().len(), 2);
        assert_eq!(loaded.cache().max_markers, 3);
    }
}
