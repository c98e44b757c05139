#![allow(dead_code)]

use async_trait::async_trait;
use bq_analyst::error::{Error, Result};
use bq_analyst::llm::{
    ChatModel, ContentBlock, ConversationMessage, LlmResponse, StopReason, ToolDef, Usage,
};
use bq_analyst::warehouse::InMemoryWarehouse;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const ORDERS_COUNT_SQL: &str = "SELECT COUNT(*) AS n FROM `acme.sales.orders`";

/// A small warehouse: one dataset with three tables and one runnable query.
pub fn sample_warehouse() -> InMemoryWarehouse {
    InMemoryWarehouse::new("acme")
        .with_table(
            "sales",
            "orders",
            &[("order_id", "INTEGER"), ("customer_id", "STRING"), ("amount", "NUMERIC")],
        )
        .with_table("sales", "customers", &[("Customer_ID", "STRING"), ("name", "STRING")])
        .with_table("sales", "regions", &[("region", "STRING")])
        .with_dataset("marketing")
        .with_query(ORDERS_COUNT_SQL, vec![json!({"n": 3})])
        .with_query(
            "SELECT order_id FROM `acme.sales.orders`",
            (1..=50).map(|i| json!({"order_id": i})).collect(),
        )
        .with_query("DELETE FROM `acme.sales.orders` WHERE true", vec![])
}

/// Replays canned model replies in order and records every conversation it was sent.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<LlmResponse>>>,
    seen: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<LlmResponse>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn conversation(&self, call: usize) -> Vec<ConversationMessage> {
        self.seen.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model(&self) -> &str {
        "gemini-2.5-flash"
    }

    async fn converse(
        &self,
        _system: &str,
        messages: &[ConversationMessage],
        _tools: &[ToolDef],
    ) -> Result<LlmResponse> {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::api("scripted", "no more scripted replies")))
    }
}

fn usage() -> Usage {
    Usage {
        input_tokens: 100,
        output_tokens: 20,
    }
}

pub fn tool_call(id: &str, name: &str, input: Value) -> Result<LlmResponse> {
    Ok(LlmResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
            signature: None,
        }],
        stop_reason: StopReason::ToolUse,
        usage: usage(),
    })
}

pub fn answer(text: &str) -> Result<LlmResponse> {
    Ok(LlmResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: StopReason::EndTurn,
        usage: usage(),
    })
}

/// Content of the tool result with `tool_use_id` anywhere in `messages`.
pub fn tool_result(messages: &[ConversationMessage], tool_use_id: &str) -> Option<(String, bool)> {
    messages.iter().flat_map(|m| &m.content).find_map(|b| match b {
        ContentBlock::ToolResult {
            tool_use_id: id,
            content,
            is_error,
            ..
        } if id == tool_use_id => Some((content.clone(), *is_error)),
        _ => None,
    })
}
