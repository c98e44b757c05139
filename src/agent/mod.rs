//! The analyst agent: its definition (model, instruction, tools, hooks),
//! the events a turn produces, and the runner that drives a turn.

pub mod event;
pub mod prompt;
pub mod runner;

pub use event::{Event, history_from_events};
pub use runner::{EventSink, Runner, TurnOutcome, TurnStats};

use crate::config::AgentConfig;
use crate::hooks::{HookChain, ToolHook};
use crate::llm::ToolDef;
use crate::tools;

pub struct AgentDefinition {
    pub name: String,
    pub model: String,
    pub instruction: String,
    pub tools: Vec<ToolDef>,
    pub hooks: HookChain,
    pub config: AgentConfig,
}

impl AgentDefinition {
    pub fn from_config(config: &AgentConfig, model: &str, project_id: &str) -> Self {
        Self {
            name: config.name.clone(),
            model: model.into(),
            instruction: prompt::instruction(config, project_id),
            tools: tools::tool_definitions(config),
            hooks: HookChain::from_config(config),
            config: config.clone(),
        }
    }

    /// Append a hook after the configured ones.
    pub fn with_hook(mut self, hook: impl ToolHook + 'static) -> Self {
        self.hooks = self.hooks.with(hook);
        self
    }
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.iter().map(|t| &t.name).collect::<Vec<_>>())
            .field("hooks", &self.hooks.names())
            .finish()
    }
}
