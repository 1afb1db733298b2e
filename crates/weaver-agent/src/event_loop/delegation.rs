//! One-level delegation from an event-loop node to a sub-agent.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{error, info};

use weaver_core::error::Result;
use weaver_core::goal::Goal;
use weaver_core::types::ToolResult;

use super::{EventLoopNode, SubagentJudge};
use crate::memory::SharedMemory;
use crate::node::{NodeContext, ReportCallback, SubagentReport};

/// Run the sub-agent named in `input` to completion. Returns the tool result
/// handed back to the parent and the tokens the sub-agent spent.
pub(crate) async fn delegate(parent: &EventLoopNode, ctx: &NodeContext, input: &Value) -> (ToolResult, u64) {
    let agent_id = input["agent_id"].as_str().unwrap_or_default();
    let task = input["task"].as_str().unwrap_or_default();

    if !ctx.spec.sub_agents.iter().any(|id| id == agent_id) {
        return (
            failure(agent_id, format!("'{}' is not a sub-agent of node '{}'", agent_id, ctx.node_id)),
            0,
        );
    }
    let Some(sub_spec) = ctx.node_registry.get(agent_id) else {
        return (failure(agent_id, format!("Sub-agent '{}' not found", agent_id)), 0);
    };
    if task.is_empty() {
        return (failure(agent_id, "'task' is required".to_string()), 0);
    }

    info!(parent = %ctx.node_id, agent_id, "Delegating to sub-agent");
    let start = Instant::now();

    // The sub-agent works on a copy; only the returned JSON reaches the parent.
    let snapshot = ctx.memory.read_all();
    let read_keys: Vec<String> = snapshot
        .keys()
        .cloned()
        .chain(sub_spec.input_keys.iter().cloned())
        .chain(sub_spec.output_keys.iter().cloned())
        .collect();
    let sub_memory = SharedMemory::from_map(snapshot);
    let scoped = sub_memory.with_permissions(agent_id, read_keys, sub_spec.output_keys.clone());

    let callback = ctx.report_callback.clone().unwrap_or_else(logging_callback);
    let sub_ctx = NodeContext {
        run_id: ctx.run_id.clone(),
        node_id: agent_id.to_string(),
        spec: sub_spec.clone(),
        memory: scoped,
        input_data: ctx.input_data.clone(),
        llm: ctx.llm.clone(),
        model: ctx.model.clone(),
        tools: ctx.tools.clone(),
        available_tools: ctx.tools.definitions_for(&sub_spec.tools),
        goal: Goal::new(task),
        event_bus: ctx.event_bus.clone(),
        node_registry: ctx.node_registry.clone(),
        is_subagent_mode: true,
        parent_node_id: Some(ctx.node_id.clone()),
        report_callback: Some(callback),
        escalations: ctx.escalations.clone(),
        cancel: ctx.cancel.child_token(),
        attempt: 1,
    };

    let sub_agent = EventLoopNode::new(parent.config.clone()).with_judge(Arc::new(SubagentJudge));
    let outcome = match sub_agent.run_loop(&sub_ctx).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(agent_id, error = %e, "Sub-agent failed");
            return (failure(agent_id, format!("Sub-agent '{}' failed: {}", agent_id, e)), 0);
        }
    };

    let result = outcome.result;
    let latency_ms = start.elapsed().as_millis() as u64;
    let message = if result.success {
        format!("Sub-agent '{}' completed.", agent_id)
    } else {
        format!(
            "Sub-agent '{}' did not complete: {}",
            agent_id,
            result.error.as_deref().unwrap_or("unknown error")
        )
    };
    let reports = if outcome.reports.is_empty() {
        Value::Null
    } else {
        json!(outcome.reports)
    };

    let body = json!({
        "message": message,
        "data": result.output,
        "metadata": {
            "agent_id": agent_id,
            "success": result.success,
            "report_count": outcome.reports.len(),
            "tokens_used": result.tokens_used,
            "latency_ms": latency_ms,
        },
        "reports": reports,
    });
    info!(agent_id, success = result.success, latency_ms, "Sub-agent finished");

    let content = body.to_string();
    let tool_result = if result.success {
        ToolResult::success(content)
    } else {
        ToolResult::error(content)
    };
    (tool_result, result.tokens_used)
}

fn failure(agent_id: &str, message: String) -> ToolResult {
    ToolResult::error(
        json!({
            "message": message,
            "data": null,
            "metadata": {
                "agent_id": agent_id,
                "success": false,
                "report_count": 0,
            },
            "reports": null,
        })
        .to_string(),
    )
}

fn logging_callback() -> ReportCallback {
    Arc::new(|report: &SubagentReport| -> Result<()> {
        info!(subagent_id = %report.subagent_id, message = %report.message, "Sub-agent report");
        Ok(())
    })
}
