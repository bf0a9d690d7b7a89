//! Configuration loading for the council service
//!
//! A single `config.json` catalog holds every model role, server defaults,
//! deliberation tuning, timeouts, memory settings, and the MCP server list.
//! Loaded once at startup; treated as immutable afterwards.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// System-default connection parameters, used when neither the model nor the
/// server section overrides them.
pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: &str = "11434";
pub const DEFAULT_BASE_URL_TEMPLATE: &str = "http://{ip}:{port}/v1";

/// A configured model: identifier plus optional per-model connection
/// overrides. Empty strings are treated as "not set".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub base_url_template: String,
    #[serde(default)]
    pub api_key: String,
}

impl ModelRef {
    pub fn is_configured(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

/// Server-wide connection defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url_template: String,
}

/// Model roles. Council and chairman are required; the rest fall back to the
/// chairman when unset so a minimal config still routes everything.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    pub council: Vec<ModelRef>,
    pub chairman: ModelRef,
    #[serde(default)]
    pub formatter: ModelRef,
    #[serde(default)]
    pub tool_calling: ModelRef,
    #[serde(default)]
    pub classification: ModelRef,
    #[serde(default)]
    pub confidence: ModelRef,
    #[serde(default)]
    pub categorization: ModelRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliberationConfig {
    #[serde(default = "default_rounds")]
    pub rounds: u8,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u8,
    #[serde(default = "default_true")]
    pub enable_cross_review: bool,
    /// Fraction of the 5-point scale below which a response is refined.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            max_rounds: default_max_rounds(),
            enable_cross_review: true,
            quality_threshold: default_quality_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageMaxTokens {
    pub stage1: Option<u32>,
    pub stage2: Option<u32>,
    pub stage3: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_response_style")]
    pub response_style: String,
    #[serde(default)]
    pub max_tokens: StageMaxTokens,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            response_style: default_response_style(),
            max_tokens: StageMaxTokens::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Council/chairman read timeout. Reasoning models need minutes.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_evaluation_timeout")]
    pub evaluation_timeout: u64,
    #[serde(default = "default_timeout")]
    pub title_generation_timeout: u64,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Per-chunk read timeout for streaming responses.
    #[serde(default = "default_streaming_chunk_timeout")]
    pub streaming_chunk_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: u64,
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker_threshold: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            evaluation_timeout: default_evaluation_timeout(),
            title_generation_timeout: default_timeout(),
            connection_timeout: default_connection_timeout(),
            streaming_chunk_timeout: default_streaming_chunk_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_factor: default_backoff_factor(),
            circuit_breaker_threshold: default_circuit_breaker(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_confidence")]
    pub confidence_threshold: f64,
    #[serde(default = "default_memory_age")]
    pub max_memory_age_days: i64,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_true")]
    pub categorization_enabled: bool,
    #[serde(default = "default_true")]
    pub record_user_messages: bool,
    #[serde(default = "default_true")]
    pub record_council_responses: bool,
    #[serde(default = "default_true")]
    pub record_chairman_synthesis: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_memory_confidence(),
            max_memory_age_days: default_memory_age(),
            group_id: default_group_id(),
            categorization_enabled: true,
            record_user_messages: true,
            record_council_responses: true,
            record_chairman_synthesis: true,
        }
    }
}

/// One MCP server entry from the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default)]
    pub command: Vec<String>,
    /// "stdio" | "http" | "external". Http is the default for local servers.
    #[serde(default = "default_transport")]
    pub transport: String,
    pub port: Option<u16>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            servers: vec![],
        }
    }
}

/// Resolved connection parameters for a single model.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub base_url: String,
    pub api_key: String,
    pub api_endpoint: String,
}

/// Full service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub models: ModelsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub deliberation: DeliberationConfig,
    #[serde(default)]
    pub response_config: ResponseConfig,
    #[serde(default)]
    pub timeout_config: TimeoutConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("invalid JSON in {}", path.display()))?;

        if config.models.council.is_empty() {
            anyhow::bail!("config must list at least one council model");
        }
        if !config.models.chairman.is_configured() {
            anyhow::bail!("config must set a chairman model");
        }

        Ok(config)
    }

    pub fn council_models(&self) -> Vec<String> {
        self.models.council.iter().map(|m| m.id.clone()).collect()
    }

    pub fn chairman_model(&self) -> String {
        self.models.chairman.id.clone()
    }

    /// Formatter model, falling back to the chairman when not configured.
    pub fn formatter_model(&self) -> String {
        self.role_or_chairman(&self.models.formatter)
    }

    pub fn tool_calling_model(&self) -> String {
        self.role_or_chairman(&self.models.tool_calling)
    }

    pub fn classification_model(&self) -> String {
        self.role_or_chairman(&self.models.classification)
    }

    pub fn confidence_model(&self) -> String {
        self.role_or_chairman(&self.models.confidence)
    }

    pub fn categorization_model(&self) -> String {
        self.role_or_chairman(&self.models.categorization)
    }

    fn role_or_chairman(&self, role: &ModelRef) -> String {
        if role.is_configured() {
            role.id.clone()
        } else {
            self.models.chairman.id.clone()
        }
    }

    /// All model ids the service may query (council plus chairman).
    pub fn valid_models(&self) -> Vec<String> {
        let mut models = self.council_models();
        let chairman = self.chairman_model();
        if !models.contains(&chairman) {
            models.push(chairman);
        }
        models
    }

    /// Resolve connection parameters for a model id.
    ///
    /// Resolution order: model-specific override > server default > system
    /// default. Unknown ids resolve to the server defaults so a misconfigured
    /// role still produces a deterministic endpoint.
    pub fn connection_info(&self, model_id: &str) -> ConnectionInfo {
        let model = self.find_model(model_id).cloned().unwrap_or_default();
        self.resolve_connection(&model)
    }

    fn find_model(&self, model_id: &str) -> Option<&ModelRef> {
        self.models
            .council
            .iter()
            .chain(std::iter::once(&self.models.chairman))
            .chain(std::iter::once(&self.models.formatter))
            .chain(std::iter::once(&self.models.tool_calling))
            .chain(std::iter::once(&self.models.classification))
            .chain(std::iter::once(&self.models.confidence))
            .chain(std::iter::once(&self.models.categorization))
            .find(|m| m.id == model_id)
    }

    fn resolve_connection(&self, model: &ModelRef) -> ConnectionInfo {
        let pick = |model_val: &str, server_val: &str, system_val: &str| -> String {
            let model_val = model_val.trim();
            let server_val = server_val.trim();
            if !model_val.is_empty() {
                model_val.to_string()
            } else if !server_val.is_empty() {
                server_val.to_string()
            } else {
                system_val.to_string()
            }
        };

        let ip = pick(&model.ip, &self.server.ip, DEFAULT_IP);
        let port = pick(&model.port, &self.server.port, DEFAULT_PORT);
        let template = pick(
            &model.base_url_template,
            &self.server.base_url_template,
            DEFAULT_BASE_URL_TEMPLATE,
        );
        let api_key = pick(&model.api_key, &self.server.api_key, "");

        let base_url = template.replace("{ip}", &ip).replace("{port}", &port);
        let api_endpoint = format!("{base_url}/chat/completions");

        ConnectionInfo {
            base_url,
            api_key,
            api_endpoint,
        }
    }

    /// Directory holding conversation documents and metrics files.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}

fn default_rounds() -> u8 {
    1
}
fn default_max_rounds() -> u8 {
    3
}
fn default_quality_threshold() -> f64 {
    0.3
}
fn default_true() -> bool {
    true
}
fn default_response_style() -> String {
    "standard".to_string()
}
fn default_timeout() -> u64 {
    300
}
fn default_evaluation_timeout() -> u64 {
    60
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_streaming_chunk_timeout() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_factor() -> u64 {
    2
}
fn default_circuit_breaker() -> u32 {
    5
}
fn default_memory_confidence() -> f64 {
    0.8
}
fn default_memory_age() -> i64 {
    30
}
fn default_group_id() -> String {
    "llm_council".to_string()
}
fn default_transport() -> String {
    "http".to_string()
}
fn default_base_port() -> u16 {
    15000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "models": {
                "council": [
                    {"id": "alpha/model-a", "name": "a"},
                    {"id": "beta/model-b", "name": "b"}
                ],
                "chairman": {"id": "gamma/chair", "name": "chair"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_role_fallbacks_to_chairman() {
        let config = minimal_config();
        assert_eq!(config.formatter_model(), "gamma/chair");
        assert_eq!(config.classification_model(), "gamma/chair");
        assert_eq!(config.confidence_model(), "gamma/chair");
    }

    #[test]
    fn test_distinct_classification_model() {
        let mut config = minimal_config();
        config.models.classification = ModelRef {
            id: "tiny/classifier".into(),
            ..Default::default()
        };
        assert_eq!(config.classification_model(), "tiny/classifier");
        // Confidence still falls back.
        assert_eq!(config.confidence_model(), "gamma/chair");
    }

    #[test]
    fn test_connection_system_defaults() {
        let config = minimal_config();
        let info = config.connection_info("alpha/model-a");
        assert_eq!(info.base_url, "http://127.0.0.1:11434/v1");
        assert_eq!(info.api_endpoint, "http://127.0.0.1:11434/v1/chat/completions");
        assert_eq!(info.api_key, "");
    }

    #[test]
    fn test_connection_model_override_beats_server() {
        let mut config = minimal_config();
        config.server.ip = "10.0.0.5".into();
        config.server.port = "8080".into();
        config.models.council[0].ip = "192.168.1.2".into();

        let info = config.connection_info("alpha/model-a");
        assert_eq!(info.base_url, "http://192.168.1.2:8080/v1");

        // Second model has no override and uses the server defaults.
        let info = config.connection_info("beta/model-b");
        assert_eq!(info.base_url, "http://10.0.0.5:8080/v1");
    }

    #[test]
    fn test_unknown_model_resolves_to_server_defaults() {
        let config = minimal_config();
        let info = config.connection_info("nobody/unknown");
        assert_eq!(info.base_url, "http://127.0.0.1:11434/v1");
    }

    #[test]
    fn test_valid_models_deduplicates_chairman() {
        let mut config = minimal_config();
        config.models.chairman.id = "alpha/model-a".into();
        let valid = config.valid_models();
        assert_eq!(valid.len(), 2);
    }

    #[test]
    fn test_deliberation_defaults() {
        let config = minimal_config();
        assert_eq!(config.deliberation.rounds, 1);
        assert_eq!(config.deliberation.max_rounds, 3);
        assert!((config.deliberation.quality_threshold - 0.3).abs() < f64::EPSILON);
    }
}
