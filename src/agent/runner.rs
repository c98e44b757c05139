//! One conversational turn: the model and the warehouse tools take turns
//! until the model answers without calling a tool, or a hard stop is hit.

use super::AgentDefinition;
use super::event::{Event, new_invocation_id};
use crate::hooks::{HookContext, HookDecision};
use crate::llm::{ChatModel, ContentBlock, ConversationMessage, Role, Usage, estimate_cost_usd};
use crate::tools::{self, ToolContext};
use crate::warehouse::Warehouse;
use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Receives events as they happen.
pub type EventSink = UnboundedSender<Event>;

/// Usage and cost for one turn.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TurnStats {
    pub turns: u32,
    pub tool_calls: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
}

impl TurnStats {
    fn accumulate(&mut self, usage: &Usage, model: &str) {
        self.turns += 1;
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.cost_usd += estimate_cost_usd(usage, model);
    }
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub invocation_id: String,
    /// Every event of the turn, starting with the user's message.
    pub events: Vec<Event>,
    /// Text of the model's final reply (empty if the turn was cut short).
    pub final_text: String,
    pub stats: TurnStats,
}

pub struct Runner {
    agent: Arc<AgentDefinition>,
    model: Arc<dyn ChatModel>,
    warehouse: Arc<dyn Warehouse>,
}

impl Runner {
    pub fn new(
        agent: Arc<AgentDefinition>,
        model: Arc<dyn ChatModel>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            agent,
            model,
            warehouse,
        }
    }

    pub fn agent(&self) -> &AgentDefinition {
        &self.agent
    }

    pub fn warehouse(&self) -> &dyn Warehouse {
        self.warehouse.as_ref()
    }

    /// Run one user turn on top of `history`.
    ///
    /// Events after the user's own message are also pushed to `sink` as they
    /// are produced. `state` is the session state; hooks keep their memory there.
    /// Fails only when the very first model call fails.
    pub async fn run_turn(
        &self,
        session_id: &str,
        history: &[ConversationMessage],
        state: &mut Map<String, Value>,
        user_text: &str,
        sink: Option<&EventSink>,
    ) -> Result<TurnOutcome> {
        let agent = &*self.agent;
        let invocation_id = new_invocation_id();
        let mut stats = TurnStats::default();
        let mut events = vec![Event::user_text(&invocation_id, user_text)];
        let mut final_text = String::new();

        let mut messages = history.to_vec();
        messages.push(ConversationMessage::user_text(user_text));

        let emit = |events: &mut Vec<Event>, event: Event| {
            if let Some(sink) = sink
                && sink.send(event.clone()).is_err()
            {
                debug!("event receiver dropped");
            }
            events.push(event);
        };

        info!(
            session = session_id,
            invocation = %invocation_id,
            agent = %agent.name,
            model = self.model.model(),
            history = history.len(),
            "starting turn"
        );

        loop {
            if stats.turns >= agent.config.max_turns {
                warn!(turns = stats.turns, "hit max turns limit");
                emit(
                    &mut events,
                    Event::error(
                        &invocation_id,
                        &agent.name,
                        format!(
                            "Stopped after {} model calls without a final answer. \
                             Try narrowing the question.",
                            stats.turns
                        ),
                    ),
                );
                break;
            }

            let response = match self
                .model
                .converse(&agent.instruction, &messages, &agent.tools)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "model call failed");
                    if stats.turns > 0 {
                        emit(
                            &mut events,
                            Event::error(
                                &invocation_id,
                                &agent.name,
                                format!("The model call failed: {}", e.user_message()),
                            ),
                        );
                        break;
                    }
                    return Err(e.into());
                }
            };

            stats.accumulate(&response.usage, self.model.model());
            debug!(
                turn = stats.turns,
                stop = ?response.stop_reason,
                cost = format!("${:.4}", stats.cost_usd),
                "model turn"
            );

            let tool_uses: Vec<_> = response
                .content
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse {
                        id, name, input, ..
                    } => Some((id.clone(), name.clone(), input.clone())),
                    _ => None,
                })
                .collect();

            let reply = ConversationMessage {
                role: Role::Assistant,
                content: response.content,
            };

            if tool_uses.is_empty() {
                final_text = reply.text();
                let mut event = Event::from_message(&invocation_id, &agent.name, &reply);
                event.turn_complete = true;
                emit(&mut events, event);
                messages.push(reply);
                break;
            }

            emit(
                &mut events,
                Event::from_message(&invocation_id, &agent.name, &reply),
            );
            messages.push(reply);

            let mut tool_results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in &tool_uses {
                stats.tool_calls += 1;
                let (content, is_error) = self.call_tool(session_id, state, name, input).await;
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    name: name.clone(),
                    content,
                    is_error,
                });
            }

            let results = ConversationMessage {
                role: Role::User,
                content: tool_results,
            };
            emit(
                &mut events,
                Event::from_message(&invocation_id, &agent.name, &results),
            );
            messages.push(results);
        }

        info!(
            session = session_id,
            invocation = %invocation_id,
            turns = stats.turns,
            tool_calls = stats.tool_calls,
            cost = format!("${:.4}", stats.cost_usd),
            "turn complete"
        );

        Ok(TurnOutcome {
            invocation_id,
            events,
            final_text,
            stats,
        })
    }

    /// Run one tool call through the hook chain.
    async fn call_tool(
        &self,
        session_id: &str,
        state: &mut Map<String, Value>,
        name: &str,
        input: &Value,
    ) -> (String, bool) {
        let agent = &*self.agent;
        let mut hook_ctx = HookContext { session_id, state };

        if let HookDecision::Block(reason) = agent.hooks.before_tool(&mut hook_ctx, name, input) {
            return (format!("Blocked: {reason}"), true);
        }

        debug!(tool = %name, "executing tool");
        let ctx = ToolContext {
            warehouse: self.warehouse.as_ref(),
            config: &agent.config,
        };
        let (content, is_error) = tools::dispatch(&ctx, name, input).await;
        agent
            .hooks
            .after_tool(&mut hook_ctx, name, input, &content, is_error);
        (content, is_error)
    }
}
