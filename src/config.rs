use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gcp: GcpConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
pub struct GcpConfig {
    /// Billing/default project. Falls back to `GOOGLE_CLOUD_PROJECT`, then the credentials.
    #[serde(default = "default_project_id")]
    pub project_id: Option<String>,
    /// Query location (e.g. `US`, `EU`). Omitted lets BigQuery infer it.
    #[serde(default = "default_location")]
    pub location: Option<String>,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            location: default_location(),
            credentials_path: None,
        }
    }
}

impl GcpConfig {
    /// Pick the project: explicit config/env first, then whatever the credentials carry.
    pub fn resolve_project(&self, credentials_project: Option<&str>) -> Result<String> {
        self.project_id
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| credentials_project.map(String::from))
            .ok_or_else(|| {
                Error::config(
                    "No GCP project configured. Set gcp.project_id in config.toml or export GOOGLE_CLOUD_PROJECT",
                )
            })
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: crate::llm::Provider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_vertex_location")]
    pub vertex_location: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: crate::llm::Provider::default(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            api_key_env: None,
            base_url: None,
            vertex_location: default_vertex_location(),
        }
    }
}

/// Agent behaviour and tool-output shaping.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// App name clients address in `/apps/{app}/...` and `/run`.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    /// Refuse `execute_query` for SQL that hasn't passed a dry run in this session.
    #[serde(default = "default_true")]
    pub require_dry_run: bool,
    #[serde(default = "default_allowed_statement_types")]
    pub allowed_statement_types: Vec<String>,
    #[serde(default)]
    pub enable_codegen: bool,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            app_name: default_app_name(),
            max_turns: default_max_turns(),
            max_result_rows: default_max_result_rows(),
            max_tool_output_chars: default_max_tool_output_chars(),
            require_dry_run: true,
            allowed_statement_types: default_allowed_statement_types(),
            enable_codegen: false,
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
            static_dir: default_static_dir(),
        }
    }
}

// Defaults
fn default_project_id() -> Option<String> {
    std::env::var("GOOGLE_CLOUD_PROJECT")
        .ok()
        .filter(|p| !p.is_empty())
}
fn default_location() -> Option<String> {
    std::env::var("BIGQUERY_LOCATION")
        .ok()
        .filter(|l| !l.is_empty())
}
fn default_model() -> String {
    "gemini-2.5-flash".into()
}
fn default_max_tokens() -> u32 {
    8192
}
fn default_temperature() -> f32 {
    0.2
}
fn default_vertex_location() -> String {
    std::env::var("GOOGLE_CLOUD_LOCATION").unwrap_or_else(|_| "global".into())
}
fn default_agent_name() -> String {
    "root_agent".into()
}
fn default_app_name() -> String {
    "agent".into()
}
fn default_max_turns() -> u32 {
    20
}
fn default_max_result_rows() -> usize {
    500
}
fn default_max_tool_output_chars() -> usize {
    20_000
}
fn default_true() -> bool {
    true
}
fn default_allowed_statement_types() -> Vec<String> {
    vec!["SELECT".into()]
}
fn default_query_timeout_ms() -> u64 {
    60_000
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:5173".into()]
}
fn default_static_dir() -> PathBuf {
    PathBuf::from("frontend").join("dist")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// Load `path` if it exists; a missing file means "all defaults".
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.max_turns == 0 {
            return Err(Error::config("agent.max_turns must be at least 1"));
        }
        if self.agent.max_result_rows == 0 {
            return Err(Error::config("agent.max_result_rows must be at least 1"));
        }
        if self.agent.allowed_statement_types.is_empty() {
            return Err(Error::config(
                "agent.allowed_statement_types must list at least one statement type",
            ));
        }
        if self.llm.provider == crate::llm::Provider::Gemini && self.llm.api_key().is_empty() {
            return Err(Error::config(format!(
                "{} not set. Export it or switch llm.provider to \"vertex\"",
                self.llm.api_key_env()
            )));
        }
        Ok(())
    }
}

impl LlmConfig {
    pub fn api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| self.provider.default_api_key_env().into())
    }

    /// API key for the Gemini developer API. `GOOGLE_API_KEY` is accepted as a fallback.
    pub fn api_key(&self) -> String {
        std::env::var(self.api_key_env())
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;

    #[test]
    fn full_config_parses() {
        let toml = r#"
[gcp]
project_id = "acme-analytics"
location = "EU"
credentials_path = "/etc/keys/bq.json"

[llm]
provider = "vertex"
model = "gemini-2.5-pro"
max_tokens = 4096
temperature = 0.0
vertex_location = "europe-west4"

[agent]
name = "analyst"
app_name = "warehouse"
max_turns = 12
max_result_rows = 100
require_dry_run = false
allowed_statement_types = ["SELECT", "SCRIPT"]
enable_codegen = true

[server]
port = 9000
cors_origins = ["https://analyst.example.com"]
static_dir = "web/dist"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.gcp.project_id.as_deref(), Some("acme-analytics"));
        assert_eq!(config.gcp.location.as_deref(), Some("EU"));
        assert_eq!(config.llm.provider, Provider::Vertex);
        assert_eq!(config.llm.model, "gemini-2.5-pro");
        assert_eq!(config.llm.vertex_location, "europe-west4");
        assert_eq!(config.agent.max_turns, 12);
        assert_eq!(config.agent.max_result_rows, 100);
        assert!(!config.agent.require_dry_run);
        assert!(config.agent.enable_codegen);
        assert_eq!(config.agent.allowed_statement_types.len(), 2);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.static_dir, PathBuf::from("web/dist"));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.llm.model, "gemini-2.5-flash");
        assert_eq!(config.llm.provider, Provider::Vertex);
        assert_eq!(config.agent.name, "root_agent");
        assert_eq!(config.agent.app_name, "agent");
        assert_eq!(config.agent.max_turns, 20);
        assert!(config.agent.require_dry_run);
        assert_eq!(config.agent.allowed_statement_types, vec!["SELECT"]);
        assert!(!config.agent.enable_codegen);
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.cors_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.agent.max_result_rows, 500);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[agent\nmax_turns = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn validate_rejects_zero_turns() {
        let mut config = Config::default();
        config.agent.max_turns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_statement_types() {
        let mut config = Config::default();
        config.agent.allowed_statement_types.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_gemini_without_key() {
        let mut config = Config::default();
        config.llm.provider = Provider::Gemini;
        config.llm.api_key_env = Some("BQ_ANALYST_TEST_UNSET_KEY".into());
        // GOOGLE_API_KEY is also consulted; only assert when it's absent.
        if std::env::var("GOOGLE_API_KEY").is_err() {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn resolve_project_prefers_config() {
        let gcp = GcpConfig {
            project_id: Some("from-config".into()),
            location: None,
            credentials_path: None,
        };
        assert_eq!(gcp.resolve_project(Some("from-key")).unwrap(), "from-config");

        let gcp = GcpConfig {
            project_id: None,
            location: None,
            credentials_path: None,
        };
        assert_eq!(gcp.resolve_project(Some("from-key")).unwrap(), "from-key");
        assert!(gcp.resolve_project(None).is_err());
    }
}
