//! Wiring: credentials, warehouse client, model client and runner from a `Config`.

use crate::agent::{AgentDefinition, Runner};
use crate::auth::{Credentials, TokenProvider};
use crate::config::Config;
use crate::llm::{LlmAuth, LlmClient, Provider};
use crate::warehouse::BigQueryClient;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// CLI override for LLM provider/model.
#[derive(Debug, Default, Clone)]
pub struct LlmOverride {
    pub provider: Option<Provider>,
    pub model: Option<String>,
}

impl LlmOverride {
    pub fn apply(&self, config: &mut Config) {
        if let Some(provider) = self.provider {
            config.llm.provider = provider;
        }
        if let Some(model) = &self.model {
            config.llm.model = model.clone();
        }
    }
}

/// Authenticated BigQuery access for the configured project.
pub struct Connection {
    pub project_id: String,
    pub tokens: Arc<TokenProvider>,
    pub warehouse: Arc<BigQueryClient>,
}

pub async fn connect(config: &Config) -> Result<Connection> {
    let credentials = Credentials::discover(config.gcp.credentials_path.as_deref())?;
    let tokens = Arc::new(TokenProvider::new(credentials)?);

    let credentials_project = match tokens.credentials().project_id() {
        Some(p) => Some(p.to_string()),
        None => tokens.metadata_project_id().await,
    };
    let project_id = config.gcp.resolve_project(credentials_project.as_deref())?;

    let warehouse = Arc::new(BigQueryClient::new(
        project_id.clone(),
        config.gcp.location.clone(),
        tokens.clone(),
        config.agent.query_timeout_ms,
    )?);

    info!(
        project = %project_id,
        credentials = tokens.credentials().kind(),
        "connected to BigQuery"
    );
    Ok(Connection {
        project_id,
        tokens,
        warehouse,
    })
}

/// Build the model client for `config.llm`, reusing the connection's tokens on Vertex AI.
pub fn model_client(config: &Config, conn: &Connection) -> Result<LlmClient> {
    let llm = &config.llm;
    let auth = match llm.provider {
        Provider::Gemini => LlmAuth::ApiKey(llm.api_key()),
        Provider::Vertex => LlmAuth::Vertex {
            project_id: conn.project_id.clone(),
            location: llm.vertex_location.clone(),
            tokens: conn.tokens.clone(),
        },
    };
    Ok(LlmClient::new(
        llm.provider,
        auth,
        llm.model.clone(),
        llm.max_tokens,
        llm.temperature,
        llm.base_url.clone(),
    )?)
}

/// Everything needed to run agent turns against the live services.
pub async fn build_runner(config: &Config) -> Result<Arc<Runner>> {
    config.validate()?;
    let conn = connect(config).await?;
    let model = Arc::new(model_client(config, &conn)?);
    let agent = AgentDefinition::from_config(&config.agent, &config.llm.model, &conn.project_id);
    info!(
        agent = %agent.name,
        model = %agent.model,
        provider = ?config.llm.provider,
        tools = agent.tools.len(),
        "agent ready"
    );
    Ok(Arc::new(Runner::new(Arc::new(agent), model, conn.warehouse)))
}
