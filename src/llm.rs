use crate::auth::TokenProvider;
use crate::error::{Error, Result};
use crate::http::{HttpClient, USER_AGENT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// LLM provider: determines endpoint and authentication.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Gemini developer API (`generativelanguage.googleapis.com`), API key auth.
    Gemini,
    /// Gemini on Vertex AI, OAuth bearer token from the GCP credentials.
    #[default]
    Vertex,
}

impl Provider {
    fn default_base_url(&self) -> &'static str {
        match self {
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::Vertex => "https://aiplatform.googleapis.com/v1",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Self::Gemini => "GEMINI_API_KEY",
            Self::Vertex => "GOOGLE_API_KEY",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gemini" | "google" | "aistudio" => Some(Self::Gemini),
            "vertex" | "vertexai" | "vertex_ai" => Some(Self::Vertex),
            _ => None,
        }
    }
}

// -- Conversation model (provider-neutral) --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        /// Opaque reasoning signature that thinking models expect echoed back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Blocked or stopped for another provider-specific reason.
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Anything that can take one conversational step with tool definitions.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model(&self) -> &str;

    async fn converse(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse>;
}

// -- Gemini generateContent format --

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

/// Where requests go and how they are authenticated.
pub enum LlmAuth {
    ApiKey(String),
    Vertex {
        project_id: String,
        location: String,
        tokens: Arc<TokenProvider>,
    },
}

pub struct LlmClient {
    provider: Provider,
    auth: LlmAuth,
    model: String,
    max_tokens: u32,
    temperature: f32,
    base_url: String,
    http: HttpClient,
}

impl LlmClient {
    pub fn new(
        provider: Provider,
        auth: LlmAuth,
        model: String,
        max_tokens: u32,
        temperature: f32,
        base_url: Option<String>,
    ) -> Result<Self> {
        let http = HttpClient::new(USER_AGENT)?;
        let base_url = base_url.unwrap_or_else(|| match (&provider, &auth) {
            (Provider::Vertex, LlmAuth::Vertex { location, .. }) if location != "global" => {
                format!("https://{location}-aiplatform.googleapis.com/v1")
            }
            _ => provider.default_base_url().into(),
        });
        Ok(Self {
            provider,
            auth,
            model,
            max_tokens,
            temperature,
            base_url,
            http,
        })
    }

    fn endpoint(&self) -> String {
        match &self.auth {
            LlmAuth::Vertex {
                project_id,
                location,
                ..
            } => format!(
                "{}/projects/{project_id}/locations/{location}/publishers/google/models/{}:generateContent",
                self.base_url, self.model
            ),
            LlmAuth::ApiKey(_) => {
                format!("{}/models/{}:generateContent", self.base_url, self.model)
            }
        }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn converse(
        &self,
        system: &str,
        messages: &[ConversationMessage],
        tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        debug!(
            provider = ?self.provider,
            model = %self.model,
            messages = messages.len(),
            "sending LLM request"
        );

        let request = build_request(
            system,
            messages,
            tools,
            GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        );
        let body = serde_json::to_string(&request)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;

        let url = self.endpoint();
        let response_text = match &self.auth {
            LlmAuth::ApiKey(key) => {
                self.http
                    .post_json_raw(&url, &body, &[("x-goog-api-key", key.as_str())])
                    .await
            }
            LlmAuth::Vertex { tokens, .. } => {
                let bearer = format!("Bearer {}", tokens.token().await?);
                self.http
                    .post_json_raw(&url, &body, &[("Authorization", bearer.as_str())])
                    .await
            }
        }
        .map_err(|e| {
            warn!("Gemini API error: {e}");
            e
        })?;

        let resp: GenerateContentResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::parse(format!("parse Gemini response: {e}")))?;
        parse_response(resp)
    }
}

fn build_request(
    system: &str,
    messages: &[ConversationMessage],
    tools: &[ToolDef],
    generation_config: GenerationConfig,
) -> GenerateContentRequest {
    let contents = messages
        .iter()
        .map(|msg| WireContent {
            role: Some(
                match msg.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                }
                .into(),
            ),
            parts: msg.content.iter().map(block_to_part).collect(),
        })
        .collect();

    let system_instruction = (!system.is_empty()).then(|| WireContent {
        role: None,
        parts: vec![WirePart {
            text: Some(system.into()),
            ..Default::default()
        }],
    });

    let tools = if tools.is_empty() {
        Vec::new()
    } else {
        vec![WireTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: declared_parameters(&t.input_schema),
                })
                .collect(),
        }]
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        generation_config,
    }
}

/// Gemini rejects OBJECT schemas with no properties; such tools declare no parameters.
fn declared_parameters(schema: &Value) -> Option<Value> {
    match schema.get("properties").and_then(Value::as_object) {
        Some(props) if !props.is_empty() => Some(schema.clone()),
        _ => None,
    }
}

fn block_to_part(block: &ContentBlock) -> WirePart {
    match block {
        ContentBlock::Text { text } => WirePart {
            text: Some(text.clone()),
            ..Default::default()
        },
        ContentBlock::ToolUse {
            name,
            input,
            signature,
            ..
        } => WirePart {
            thought_signature: signature.clone(),
            function_call: Some(WireFunctionCall {
                id: None,
                name: name.clone(),
                args: input.clone(),
            }),
            ..Default::default()
        },
        ContentBlock::ToolResult {
            name,
            content,
            is_error,
            ..
        } => {
            // Structured results go back as JSON so the model sees fields, not a string.
            let payload =
                serde_json::from_str::<Value>(content).unwrap_or_else(|_| json!(content));
            let response = if *is_error {
                json!({ "error": payload })
            } else {
                json!({ "result": payload })
            };
            WirePart {
                function_response: Some(WireFunctionResponse {
                    id: None,
                    name: name.clone(),
                    response,
                }),
                ..Default::default()
            }
        }
    }
}

fn parse_response(resp: GenerateContentResponse) -> Result<LlmResponse> {
    let usage = resp
        .usage_metadata
        .map(|u| Usage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    let Some(candidate) = resp.candidates.into_iter().next() else {
        let reason = resp
            .prompt_feedback
            .and_then(|f| f["blockReason"].as_str().map(String::from))
            .unwrap_or_else(|| "no candidates".into());
        return Err(Error::api("gemini", format!("empty response: {reason}")));
    };

    let mut content = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            content.push(ContentBlock::ToolUse {
                id,
                name: call.name,
                input: if call.args.is_null() { json!({}) } else { call.args },
                signature: part.thought_signature,
            });
        } else if let Some(text) = part.text {
            if part.thought == Some(true) || text.is_empty() {
                continue;
            }
            content.push(ContentBlock::Text { text });
        }
    }

    let has_tool_use = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = if has_tool_use {
        StopReason::ToolUse
    } else {
        match candidate.finish_reason.as_deref() {
            None | Some("STOP") => StopReason::EndTurn,
            Some("MAX_TOKENS") => StopReason::MaxTokens,
            Some(other) => StopReason::Other(other.into()),
        }
    };

    Ok(LlmResponse {
        content,
        stop_reason,
        usage,
    })
}

/// Rough USD cost of a call, from list prices per million tokens.
pub fn estimate_cost_usd(usage: &Usage, model: &str) -> f64 {
    let (input_per_m, output_per_m) = if model.contains("flash-lite") {
        (0.10, 0.40)
    } else if model.contains("pro") {
        (1.25, 10.0)
    } else {
        (0.30, 2.50)
    };
    (usage.input_tokens as f64 * input_per_m + usage.output_tokens as f64 * output_per_m)
        / 1_000_000.0
}
