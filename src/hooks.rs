//! Pre/post tool hooks.
//!
//! Hooks see every tool call the model makes. A hook may veto a call before
//! it runs; the veto reason goes back to the model as an error result.
//! Hooks keep per-session memory in the session state map handed to them.

use crate::config::AgentConfig;
use crate::tools::{DRY_RUN_QUERY, EXECUTE_QUERY};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State key under which [`DryRunGate`] records validated queries.
pub const VALIDATED_QUERIES_KEY: &str = "validated_queries";

/// What a hook sees about the call site.
pub struct HookContext<'a> {
    pub session_id: &'a str,
    pub state: &'a mut Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Block(String),
}

pub trait ToolHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn before_tool(&self, _ctx: &mut HookContext<'_>, _tool: &str, _args: &Value) -> HookDecision {
        HookDecision::Proceed
    }

    fn after_tool(
        &self,
        _ctx: &mut HookContext<'_>,
        _tool: &str,
        _args: &Value,
        _output: &str,
        _is_error: bool,
    ) {
    }
}

/// Ordered hooks; the first block wins and later hooks are not consulted.
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn ToolHook>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain for an agent: audit logging, plus the dry-run gate when required.
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut chain = Self::new().with(AuditHook);
        if config.require_dry_run {
            chain = chain.with(DryRunGate::new(config.allowed_statement_types.clone()));
        }
        chain
    }

    pub fn with(mut self, hook: impl ToolHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    pub fn before_tool(&self, ctx: &mut HookContext<'_>, tool: &str, args: &Value) -> HookDecision {
        for hook in &self.hooks {
            if let HookDecision::Block(reason) = hook.before_tool(ctx, tool, args) {
                debug!(hook = hook.name(), tool, %reason, "tool call blocked");
                return HookDecision::Block(reason);
            }
        }
        HookDecision::Proceed
    }

    pub fn after_tool(
        &self,
        ctx: &mut HookContext<'_>,
        tool: &str,
        args: &Value,
        output: &str,
        is_error: bool,
    ) {
        for hook in &self.hooks {
            hook.after_tool(ctx, tool, args, output, is_error);
        }
    }
}

/// Logs every tool call and its outcome.
pub struct AuditHook;

impl ToolHook for AuditHook {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn before_tool(&self, ctx: &mut HookContext<'_>, tool: &str, args: &Value) -> HookDecision {
        info!(session = ctx.session_id, tool, args = %args, "tool call");
        HookDecision::Proceed
    }

    fn after_tool(
        &self,
        ctx: &mut HookContext<'_>,
        tool: &str,
        _args: &Value,
        output: &str,
        is_error: bool,
    ) {
        if is_error {
            warn!(session = ctx.session_id, tool, error = output, "tool call failed");
        } else {
            info!(
                session = ctx.session_id,
                tool,
                output_chars = output.chars().count(),
                "tool call succeeded"
            );
        }
    }
}

/// Only lets `execute_query` run SQL that already passed a dry run in this
/// session and whose statement type is allowed.
pub struct DryRunGate {
    allowed_statement_types: Vec<String>,
}

impl DryRunGate {
    pub fn new(allowed_statement_types: Vec<String>) -> Self {
        Self {
            allowed_statement_types: allowed_statement_types
                .into_iter()
                .map(|t| t.trim().to_ascii_uppercase())
                .collect(),
        }
    }

    fn is_allowed(&self, statement_type: &str) -> bool {
        self.allowed_statement_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(statement_type))
    }
}

impl ToolHook for DryRunGate {
    fn name(&self) -> &'static str {
        "dry_run_gate"
    }

    fn before_tool(&self, ctx: &mut HookContext<'_>, tool: &str, args: &Value) -> HookDecision {
        if tool != EXECUTE_QUERY {
            return HookDecision::Proceed;
        }
        let Some(query) = args["query"].as_str() else {
            // The tool reports the missing argument itself.
            return HookDecision::Proceed;
        };

        let key = normalize_sql(query);
        let validated = ctx
            .state
            .get(VALIDATED_QUERIES_KEY)
            .and_then(|v| v.get(&key));
        match validated {
            None => HookDecision::Block(
                "This query has not passed dry_run_query. Dry run this exact query first, \
                 then execute it."
                    .into(),
            ),
            Some(Value::String(statement_type)) if self.is_allowed(statement_type) => {
                HookDecision::Proceed
            }
            Some(Value::String(statement_type)) => HookDecision::Block(format!(
                "Statement type {statement_type} is not allowed. Only {} statements may be executed.",
                self.allowed_statement_types.join(", ")
            )),
            Some(_) => HookDecision::Block(
                "The dry run did not report a statement type, so the query cannot be executed."
                    .into(),
            ),
        }
    }

    fn after_tool(
        &self,
        ctx: &mut HookContext<'_>,
        tool: &str,
        args: &Value,
        output: &str,
        is_error: bool,
    ) {
        if tool != DRY_RUN_QUERY || is_error {
            return;
        }
        let Some(query) = args["query"].as_str() else {
            return;
        };
        let statement_type = serde_json::from_str::<Value>(output)
            .ok()
            .and_then(|v| v["statement_type"].as_str().map(str::to_string));

        let entry = ctx
            .state
            .entry(VALIDATED_QUERIES_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(validated) = entry {
            validated.insert(
                normalize_sql(query),
                statement_type.map(Value::String).unwrap_or(Value::Null),
            );
        }
    }
}

/// Key under which a query's dry run is remembered: the exact text minus
/// surrounding whitespace and trailing semicolons. Nothing inside the
/// statement is rewritten, so two different statements never share a key.
pub fn normalize_sql(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

/// Drop hook-owned keys from state supplied by a client. Returns whether
/// anything was removed.
pub fn strip_hook_state(state: &mut Map<String, Value>) -> bool {
    state.remove(VALIDATED_QUERIES_KEY).is_some()
}
