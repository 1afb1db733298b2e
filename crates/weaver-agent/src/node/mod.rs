//! Node execution protocol and its variants.

pub mod function;
pub mod human;
pub mod llm;
pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use weaver_core::config::ModelConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventBus;
use weaver_core::goal::Goal;
use weaver_core::traits::LlmClient;
use weaver_core::types::{AgentEvent, RunId, ToolContext, ToolDefinition, ToolResult};
use weaver_tools::ToolRegistry;

use crate::event_loop::EscalationRegistry;
use crate::graph::{NodeKind, NodeSpec};
use crate::memory::ScopedMemory;

pub use function::{FunctionNode, FunctionRegistry, NodeFunction};
pub use human::HumanInputNode;
pub use llm::LlmNode;
pub use router::RouterNode;

/// Progress report a sub-agent sends to whoever delegated to it.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentReport {
    pub subagent_id: String,
    pub message: String,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Receives sub-agent reports. Errors are logged, never propagated.
pub type ReportCallback = Arc<dyn Fn(&SubagentReport) -> Result<()> + Send + Sync>;

/// Everything one node invocation may touch.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: String,
    pub spec: NodeSpec,
    /// View limited to the node's declared keys.
    pub memory: ScopedMemory,
    /// Sanitized caller input for this run.
    pub input_data: HashMap<String, Value>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub model: ModelConfig,
    pub tools: Arc<ToolRegistry>,
    /// Definitions of the node's declared tools.
    pub available_tools: Vec<ToolDefinition>,
    pub goal: Goal,
    pub event_bus: Option<Arc<EventBus>>,
    /// Every node in the graph, used to resolve sub-agents.
    pub node_registry: Arc<HashMap<String, NodeSpec>>,
    pub is_subagent_mode: bool,
    /// Node that delegated to this one, in sub-agent mode.
    pub parent_node_id: Option<String>,
    pub report_callback: Option<ReportCallback>,
    pub escalations: Arc<EscalationRegistry>,
    pub cancel: CancellationToken,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
}

impl NodeContext {
    /// Caller input overlaid with whatever the node may read from memory.
    pub fn context_data(&self) -> HashMap<String, Value> {
        let mut data = self.input_data.clone();
        data.extend(self.memory.read_all());
        data
    }

    /// Look up `key` in readable memory, then in the caller input.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.memory.read(key).or_else(|| self.input_data.get(key).cloned())
    }

    pub fn publish(&self, event: AgentEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    pub fn llm(&self) -> Result<Arc<dyn LlmClient>> {
        self.llm
            .clone()
            .ok_or_else(|| WeaverError::LlmUnavailable(self.node_id.clone()))
    }

    /// Run one of the node's declared tools, turning errors into error results.
    pub async fn call_tool(&self, name: &str, input: Value) -> ToolResult {
        if !self.spec.tools.iter().any(|t| t == name) {
            return ToolResult::error(format!("Tool '{}' is not available to node '{}'", name, self.node_id));
        }

        self.publish(AgentEvent::ToolStart {
            node_id: self.node_id.clone(),
            name: name.to_string(),
            input: input.clone(),
        });

        let ctx = ToolContext {
            run_id: self.run_id.clone(),
            node_id: self.node_id.clone(),
        };
        let result = match self.tools.execute(name, input, ctx).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(node_id = %self.node_id, tool = %name, error = %e, "Tool execution failed");
                ToolResult::error(e.to_string())
            }
        };

        self.publish(AgentEvent::ToolEnd {
            node_id: self.node_id.clone(),
            name: name.to_string(),
            result: result.clone(),
        });
        result
    }
}

/// What one node execution produced.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub success: bool,
    pub output: HashMap<String, Value>,
    pub error: Option<String>,
    /// Successor chosen by the node itself; bypasses edge evaluation.
    pub next_node: Option<String>,
    pub tokens_used: u64,
    pub latency_ms: u64,
}

impl NodeResult {
    pub fn ok(output: HashMap<String, Value>) -> Self {
        Self {
            success: true,
            output,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_next(mut self, node_id: impl Into<String>) -> Self {
        self.next_node = Some(node_id.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_output(mut self, output: HashMap<String, Value>) -> Self {
        self.output = output;
        self
    }
}

/// Contract every node kind implements.
///
/// An `Err` from `execute` is a node failure and goes through the executor's
/// retry rules.
pub trait NodeProtocol: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Warnings about missing inputs. Execution proceeds regardless.
    fn validate_input(&self, ctx: &NodeContext) -> Vec<String> {
        ctx.spec
            .input_keys
            .iter()
            .filter(|key| ctx.lookup(key).is_none())
            .map(|key| format!("Node '{}' is missing input key '{}'", ctx.node_id, key))
            .collect()
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>>;
}

/// Store the model's final text under the node's output keys.
///
/// A JSON object response contributes the declared keys it carries; any
/// other response is stored whole under every declared key.
pub(crate) fn ingest_output(output_keys: &[String], text: &str) -> HashMap<String, Value> {
    let mut output = HashMap::new();
    if output_keys.is_empty() {
        return output;
    }

    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text.trim()) {
        for key in output_keys {
            if let Some(val) = obj.get(key) {
                output.insert(key.clone(), val.clone());
            }
        }
        return output;
    }

    for key in output_keys {
        output.insert(key.clone(), Value::String(text.to_string()));
    }
    output
}
