//! Conversation events as stored in sessions and streamed to clients.
//!
//! The JSON shape (camelCase, `content.parts[]` with `text`,
//! `functionCall` or `functionResponse`) is what the web frontend reads.

use crate::llm::{ContentBlock, ConversationMessage, Role};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub const USER_AUTHOR: &str = "user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub invocation_id: String,
    pub author: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_responses: Vec<FunctionResponse>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    /// `user` or `model`.
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// `response` is `{"result": ...}` on success and `{"error": "..."}` on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

pub fn new_invocation_id() -> String {
    format!("e-{}", Uuid::new_v4())
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Event {
    fn base(invocation_id: &str, author: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            invocation_id: invocation_id.into(),
            author: author.into(),
            timestamp: now_secs(),
            content: None,
            function_calls: Vec::new(),
            function_responses: Vec::new(),
            turn_complete: false,
            error_message: None,
        }
    }

    pub fn user_text(invocation_id: &str, text: &str) -> Self {
        Self::from_message(invocation_id, USER_AUTHOR, &ConversationMessage::user_text(text))
    }

    /// An event carrying one conversation message.
    pub fn from_message(invocation_id: &str, author: &str, message: &ConversationMessage) -> Self {
        let mut event = Self::base(invocation_id, author);
        let mut parts = Vec::with_capacity(message.content.len());

        for block in &message.content {
            match block {
                ContentBlock::Text { text } => parts.push(Part {
                    text: Some(text.clone()),
                    ..Part::default()
                }),
                ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    signature,
                } => {
                    let call = FunctionCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: input.clone(),
                    };
                    event.function_calls.push(call.clone());
                    parts.push(Part {
                        function_call: Some(call),
                        thought_signature: signature.clone(),
                        ..Part::default()
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    name,
                    content,
                    is_error,
                } => {
                    let response = FunctionResponse {
                        id: tool_use_id.clone(),
                        name: name.clone(),
                        response: response_value(content, *is_error),
                    };
                    event.function_responses.push(response.clone());
                    parts.push(Part {
                        function_response: Some(response),
                        ..Part::default()
                    });
                }
            }
        }

        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        event.content = Some(Content {
            role: role.into(),
            parts,
        });
        event
    }

    /// A terminal failure shown to the user as model text.
    pub fn error(invocation_id: &str, author: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut event = Self::base(invocation_id, author);
        event.content = Some(Content {
            role: "model".into(),
            parts: vec![Part {
                text: Some(message.clone()),
                ..Part::default()
            }],
        });
        event.error_message = Some(message);
        event.turn_complete = true;
        event
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .flat_map(|c| c.parts.iter())
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The conversation message this event records; error events and events
    /// without content have none.
    pub fn to_message(&self) -> Option<ConversationMessage> {
        if self.error_message.is_some() {
            return None;
        }
        let content = self.content.as_ref()?;
        let role = if content.role == "model" {
            Role::Assistant
        } else {
            Role::User
        };

        let blocks: Vec<ContentBlock> = content
            .parts
            .iter()
            .filter_map(|part| {
                if let Some(call) = &part.function_call {
                    Some(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                        signature: part.thought_signature.clone(),
                    })
                } else if let Some(resp) = &part.function_response {
                    let (content, is_error) = response_text(&resp.response);
                    Some(ContentBlock::ToolResult {
                        tool_use_id: resp.id.clone(),
                        name: resp.name.clone(),
                        content,
                        is_error,
                    })
                } else {
                    part.text.as_ref().map(|text| ContentBlock::Text { text: text.clone() })
                }
            })
            .collect();

        (!blocks.is_empty()).then_some(ConversationMessage {
            role,
            content: blocks,
        })
    }
}

/// Tool output as a structured response; JSON output is embedded as JSON.
fn response_value(content: &str, is_error: bool) -> Value {
    if is_error {
        return json!({ "error": content });
    }
    let result = serde_json::from_str::<Value>(content)
        .unwrap_or_else(|_| Value::String(content.to_string()));
    json!({ "result": result })
}

fn response_text(response: &Value) -> (String, bool) {
    if let Some(err) = response.get("error") {
        return (value_text(err), true);
    }
    (value_text(response.get("result").unwrap_or(response)), false)
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Conversation history recorded by a sequence of events.
pub fn history_from_events(events: &[Event]) -> Vec<ConversationMessage> {
    events.iter().filter_map(Event::to_message).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_for_frontend() {
        let message = ConversationMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "list_datasets".into(),
                input: json!({}),
                signature: None,
            }],
        };
        let event = Event::from_message("e-1", "root_agent", &message);
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["invocationId"], "e-1");
        assert_eq!(v["author"], "root_agent");
        assert_eq!(v["content"]["role"], "model");
        assert_eq!(v["content"]["parts"][0]["functionCall"]["name"], "list_datasets");
        assert_eq!(v["functionCalls"][0]["name"], "list_datasets");
        assert_eq!(v["turnComplete"], false);
        assert!(v.get("errorMessage").is_none());
    }

    #[test]
    fn tool_results_survive_history_reconstruction() {
        let results = ConversationMessage {
            role: Role::User,
            content: vec![
                ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    name: "list_datasets".into(),
                    content: r#"["sales"]"#.into(),
                    is_error: false,
                },
                ContentBlock::ToolResult {
                    tool_use_id: "call_2".into(),
                    name: "list_tables".into(),
                    content: "Error listing tables: Not found".into(),
                    is_error: true,
                },
            ],
        };
        let event = Event::from_message("e-1", "root_agent", &results);
        assert_eq!(
            event.function_responses[0].response,
            json!({"result": ["sales"]})
        );
        assert_eq!(event.to_message(), Some(results));
    }

    #[test]
    fn error_events_are_left_out_of_history() {
        let events = vec![
            Event::user_text("e-1", "how many orders?"),
            Event::error("e-1", "root_agent", "model unavailable"),
        ];
        let history = history_from_events(&events);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "how many orders?");
        assert_eq!(events[1].text(), "model unavailable");
        assert!(events[1].turn_complete);
    }
}
