//! Agentic event-loop node: a multi-turn tool-calling loop with a pluggable
//! judge, one level of sub-agent delegation, and blocking escalations.

pub mod delegation;
pub mod escalation;
pub mod judge;
pub mod tools;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use weaver_core::config::EventLoopConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::types::*;

use crate::graph::NodeKind;
use crate::llm_call::{stream_turn, ToolCall};
use crate::node::{NodeContext, NodeProtocol, NodeResult, SubagentReport};

pub use escalation::{EscalationReceiver, EscalationRegistry, EscalationState, PendingEscalation};
pub use judge::{DefaultJudge, Judge, JudgeInput, LlmJudge, SubagentJudge, ToolOutcome, Verdict};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an autonomous agent working on one step of a larger workflow. Use your tools to do the work.";

/// Result of one loop run, including reports sent while it ran.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub result: NodeResult,
    pub reports: Vec<SubagentReport>,
}

#[derive(Default)]
struct LoopState {
    outputs: HashMap<String, Value>,
    reports: Vec<SubagentReport>,
    mark_complete: bool,
    delegated_tokens: u64,
}

/// The event-loop node kind.
pub struct EventLoopNode {
    config: EventLoopConfig,
    judge: Arc<dyn Judge>,
}

impl EventLoopNode {
    pub fn new(config: EventLoopConfig) -> Self {
        Self {
            config,
            judge: Arc::new(DefaultJudge),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = judge;
        self
    }

    /// Sub-agents this node may delegate to right now. Always empty in
    /// sub-agent mode.
    pub fn delegable_agents(ctx: &NodeContext) -> Vec<String> {
        if ctx.is_subagent_mode {
            return vec![];
        }
        ctx.spec
            .sub_agents
            .iter()
            .filter(|id| ctx.node_registry.contains_key(*id))
            .cloned()
            .collect()
    }

    fn can_report(ctx: &NodeContext) -> bool {
        ctx.is_subagent_mode && ctx.report_callback.is_some()
    }

    /// The node's own tools plus the injected ones visible in this context.
    pub fn tool_definitions(ctx: &NodeContext) -> Vec<ToolDefinition> {
        let mut defs = ctx.available_tools.clone();
        if !ctx.spec.output_keys.is_empty() {
            defs.push(tools::set_output(&ctx.spec.output_keys));
        }
        let agents = Self::delegable_agents(ctx);
        if !agents.is_empty() {
            defs.push(tools::delegate(&agents));
        }
        if Self::can_report(ctx) {
            defs.push(tools::report_to_parent());
        }
        defs
    }

    fn system_prompt(ctx: &NodeContext) -> String {
        let mut prompt = ctx
            .spec
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        prompt.push_str("\n\n");
        prompt.push_str(&ctx.goal.to_prompt_context());

        if !ctx.spec.output_keys.is_empty() {
            prompt.push_str(&format!(
                "\n## Outputs\n\nCall set_output once for each of: {}\n",
                ctx.spec.output_keys.join(", ")
            ));
        }
        if let Some(criteria) = &ctx.spec.success_criteria {
            prompt.push_str(&format!("\n## Done when\n\n{}\n", criteria));
        }
        if ctx.is_subagent_mode {
            prompt.push_str("\nYou are a sub-agent. Work only on the delegated task.\n");
        }
        prompt
    }

    /// Drive the loop to a verdict. Used directly by delegation, which also
    /// needs the reports.
    pub fn run_loop<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<LoopOutcome>> {
        Box::pin(async move {
            let start = Instant::now();
            let llm = ctx.llm()?;
            let tool_defs = Self::tool_definitions(ctx);
            let max_iterations = self.config.max_iterations.min(ctx.spec.max_turns).max(1);

            let task_line = if ctx.is_subagent_mode {
                format!("Task: {}", ctx.goal.description)
            } else {
                "Work on the goal described above.".to_string()
            };
            let mut messages = vec![
                ChatMessage::system(Self::system_prompt(ctx)),
                ChatMessage::user(ctx.spec.build_prompt(&task_line, &ctx.context_data())),
            ];

            let mut state = LoopState::default();
            let mut tokens = 0u64;
            let mut accepted = false;

            for iteration in 0..max_iterations {
                if ctx.cancel.is_cancelled() {
                    return Err(WeaverError::Cancelled);
                }
                debug!(node_id = %ctx.node_id, iteration, "Event loop turn");

                let turn = stream_turn(
                    llm.as_ref(),
                    &ctx.model,
                    messages.clone(),
                    &tool_defs,
                    ctx.event_bus.as_deref(),
                    &ctx.node_id,
                    &ctx.cancel,
                )
                .await?;
                tokens += turn.tokens();
                messages.push(turn.assistant_message());

                let mut outcomes = Vec::with_capacity(turn.tool_calls.len());
                let mut blocks = Vec::with_capacity(turn.tool_calls.len());
                for (i, call) in turn.tool_calls.iter().enumerate() {
                    let result = if i >= self.config.max_tool_calls_per_turn {
                        ToolResult::error(format!(
                            "Skipped: at most {} tool calls per turn",
                            self.config.max_tool_calls_per_turn
                        ))
                    } else {
                        self.dispatch(ctx, &mut state, call).await
                    };
                    let content = truncate(&result.content, self.config.max_tool_output_chars);
                    outcomes.push(ToolOutcome {
                        name: call.name.clone(),
                        content: content.clone(),
                        is_error: result.is_error,
                    });
                    blocks.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content,
                        is_error: result.is_error,
                    });
                }

                ctx.publish(AgentEvent::TurnComplete {
                    node_id: ctx.node_id.clone(),
                    turn: iteration,
                });

                if state.mark_complete {
                    info!(node_id = %ctx.node_id, iteration, "Sub-agent marked itself complete");
                    accepted = true;
                    break;
                }

                let missing: Vec<String> = ctx
                    .spec
                    .output_keys
                    .iter()
                    .filter(|k| !state.outputs.contains_key(*k))
                    .cloned()
                    .collect();
                let input = JudgeInput {
                    task: &ctx.goal.description,
                    output_keys: &ctx.spec.output_keys,
                    missing_keys: &missing,
                    outputs: &state.outputs,
                    tool_results: &outcomes,
                    iteration,
                    success_criteria: ctx.spec.success_criteria.as_deref(),
                };

                match self.judge.evaluate(&input).await {
                    Verdict::Accept => {
                        accepted = true;
                        break;
                    }
                    Verdict::Retry { feedback } => {
                        debug!(node_id = %ctx.node_id, iteration, feedback = %feedback, "Judge asked for another turn");
                        if blocks.is_empty() {
                            let text = if feedback.is_empty() { "Continue.".to_string() } else { feedback };
                            messages.push(ChatMessage::user(text));
                        } else {
                            if !feedback.is_empty() {
                                blocks.push(ContentBlock::Text { text: feedback });
                            }
                            messages.push(ChatMessage {
                                role: Role::User,
                                content: blocks,
                                timestamp: Some(Utc::now()),
                            });
                        }
                    }
                }
            }

            let total_tokens = tokens + state.delegated_tokens;
            let mut result = if accepted {
                info!(node_id = %ctx.node_id, tokens = total_tokens, "Event loop accepted");
                NodeResult::ok(state.outputs)
            } else {
                let missing: Vec<&str> = ctx
                    .spec
                    .output_keys
                    .iter()
                    .filter(|k| !state.outputs.contains_key(*k))
                    .map(String::as_str)
                    .collect();
                warn!(node_id = %ctx.node_id, max_iterations, "Event loop exhausted its iterations");
                NodeResult::failure(format!(
                    "Event loop '{}' did not finish within {} iterations (missing: {})",
                    ctx.node_id,
                    max_iterations,
                    missing.join(", ")
                ))
                .with_output(state.outputs)
            };
            result.tokens_used = total_tokens;
            result.latency_ms = start.elapsed().as_millis() as u64;

            Ok(LoopOutcome {
                result,
                reports: state.reports,
            })
        })
    }

    async fn dispatch(&self, ctx: &NodeContext, state: &mut LoopState, call: &ToolCall) -> ToolResult {
        match call.name.as_str() {
            tools::SET_OUTPUT if !ctx.spec.output_keys.is_empty() => set_output(ctx, state, &call.input),
            tools::DELEGATE if !Self::delegable_agents(ctx).is_empty() => {
                let (result, tokens) = delegation::delegate(self, ctx, &call.input).await;
                state.delegated_tokens += tokens;
                result
            }
            tools::REPORT_TO_PARENT if Self::can_report(ctx) => self.report(ctx, state, &call.input).await,
            name => ctx.call_tool(name, call.input.clone()).await,
        }
    }

    async fn report(&self, ctx: &NodeContext, state: &mut LoopState, input: &Value) -> ToolResult {
        let message = input["message"].as_str().unwrap_or_default().to_string();
        if message.is_empty() {
            return ToolResult::error("'message' is required");
        }
        let data = input.get("data").filter(|v| !v.is_null()).cloned();
        let mark_complete = input["mark_complete"].as_bool().unwrap_or(false);
        let wait_for_response = input["wait_for_response"].as_bool().unwrap_or(false);

        let report = SubagentReport {
            subagent_id: ctx.node_id.clone(),
            message: message.clone(),
            data: data.clone(),
            timestamp: Utc::now(),
        };
        state.reports.push(report.clone());
        if let Some(callback) = &ctx.report_callback {
            if let Err(e) = callback(&report) {
                warn!(node_id = %ctx.node_id, error = %e, "Report callback failed");
            }
        }
        ctx.publish(AgentEvent::SubagentReport {
            node_id: ctx.parent_node_id.clone().unwrap_or_else(|| ctx.node_id.clone()),
            subagent_id: ctx.node_id.clone(),
            message: message.clone(),
            data,
        });

        if mark_complete {
            state.mark_complete = true;
        }
        if !wait_for_response {
            return ToolResult::success("Report delivered.");
        }

        let Some(bus) = ctx.event_bus.as_ref() else {
            debug!(node_id = %ctx.node_id, "No event bus, not waiting for a response");
            return ToolResult::success("Report delivered. No response channel is attached; continue without a reply.");
        };

        let pending = PendingEscalation::open(&ctx.escalations, &ctx.node_id);
        let receiver = pending.receiver();
        let escalation_id = receiver.id().to_string();
        bus.publish(AgentEvent::ClientOutputDelta {
            node_id: ctx.node_id.clone(),
            content: message.clone(),
        });
        bus.publish(AgentEvent::ClientInputRequested {
            node_id: ctx.node_id.clone(),
            escalation_id: escalation_id.clone(),
            prompt: message,
        });
        info!(node_id = %ctx.node_id, escalation_id = %escalation_id, "Waiting for escalation response");

        let wait = async {
            if self.config.escalation_timeout_secs == 0 {
                return receiver.wait().await;
            }
            let limit = Duration::from_secs(self.config.escalation_timeout_secs);
            match tokio::time::timeout(limit, receiver.wait()).await {
                Ok(response) => response,
                Err(_) => {
                    warn!(escalation_id = %escalation_id, "Escalation timed out");
                    receiver.cancel();
                    None
                }
            }
        };
        let response = tokio::select! {
            response = wait => response,
            _ = ctx.cancel.cancelled() => {
                receiver.cancel();
                None
            }
        };
        drop(pending);

        match response {
            Some(value) => ToolResult::success(value),
            None => ToolResult::error(format!("No response received for escalation {}", escalation_id)),
        }
    }
}

fn set_output(ctx: &NodeContext, state: &mut LoopState, input: &Value) -> ToolResult {
    let Some(key) = input["key"].as_str() else {
        return ToolResult::error("'key' is required");
    };
    if !ctx.spec.output_keys.iter().any(|k| k == key) {
        return ToolResult::error(format!(
            "Unknown output key '{}'. Declared keys: {}",
            key,
            ctx.spec.output_keys.join(", ")
        ));
    }
    let Some(value) = input.get("value").filter(|v| !v.is_null()) else {
        return ToolResult::error("'value' is required");
    };
    state.outputs.insert(key.to_string(), value.clone());
    ToolResult::success(format!("Output '{}' recorded.", key))
}

fn truncate(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut out: String = content.chars().take(max_chars).collect();
    out.push_str("\n[output truncated]");
    out
}

impl NodeProtocol for EventLoopNode {
    fn kind(&self) -> NodeKind {
        NodeKind::EventLoop
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(async move { self.run_loop(ctx).await.map(|outcome| outcome.result) })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use weaver_core::event::EventBus;
    use weaver_core::traits::LlmClient;
    use weaver_test_utils::{text_response, tool_call_response, ScriptedLlm};

    use super::*;
    use crate::graph::NodeSpec;
    use crate::memory::SharedMemory;
    use crate::node::test_support::context;
    use crate::node::ReportCallback;

    fn names(defs: &[ToolDefinition]) -> Vec<String> {
        defs.iter().map(|d| d.name.clone()).collect()
    }

    fn helper_registry() -> Arc<HashMap<String, NodeSpec>> {
        let helper = NodeSpec::new("helper", "Helper", NodeKind::EventLoop).with_outputs(["notes"]);
        Arc::new(HashMap::from([("helper".to_string(), helper)]))
    }

    fn noop_callback() -> ReportCallback {
        Arc::new(|_: &SubagentReport| -> Result<()> { Ok(()) })
    }

    #[test]
    fn delegate_tool_hidden_in_subagent_mode() {
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("lead", "Lead", NodeKind::EventLoop)
            .with_outputs(["plan"])
            .with_sub_agents(["helper", "ghost"]);
        let mut ctx = context(spec, &memory, None);
        ctx.node_registry = helper_registry();

        let top = names(&EventLoopNode::tool_definitions(&ctx));
        assert!(top.contains(&tools::DELEGATE.to_string()));
        assert!(top.contains(&tools::SET_OUTPUT.to_string()));
        assert_eq!(EventLoopNode::delegable_agents(&ctx), vec!["helper"]);

        ctx.is_subagent_mode = true;
        ctx.report_callback = Some(noop_callback());
        let nested = names(&EventLoopNode::tool_definitions(&ctx));
        assert!(!nested.contains(&tools::DELEGATE.to_string()));
        assert!(nested.contains(&tools::REPORT_TO_PARENT.to_string()));
    }

    #[test]
    fn delegate_tool_needs_resolvable_agents() {
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("lead", "Lead", NodeKind::EventLoop).with_sub_agents(["ghost"]);
        let mut ctx = context(spec, &memory, None);
        ctx.node_registry = helper_registry();
        assert!(!names(&EventLoopNode::tool_definitions(&ctx)).contains(&tools::DELEGATE.to_string()));
    }

    #[test]
    fn report_tool_needs_mode_and_callback() {
        let memory = SharedMemory::new();
        let mut ctx = context(NodeSpec::new("s", "Sub", NodeKind::EventLoop), &memory, None);
        let has_report = |ctx: &NodeContext| {
            names(&EventLoopNode::tool_definitions(ctx)).contains(&tools::REPORT_TO_PARENT.to_string())
        };

        assert!(!has_report(&ctx));
        ctx.is_subagent_mode = true;
        assert!(!has_report(&ctx));
        ctx.report_callback = Some(noop_callback());
        assert!(has_report(&ctx));
        ctx.is_subagent_mode = false;
        assert!(!has_report(&ctx));
    }

    #[tokio::test]
    async fn set_output_fills_keys_and_accepts() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("set_output", json!({"key": "summary", "value": "short"}))]),
        ]));
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("s", "Summarizer", NodeKind::EventLoop).with_outputs(["summary"]);
        let ctx = context(spec, &memory, Some(llm.clone() as Arc<dyn LlmClient>));

        let result = EventLoopNode::new(EventLoopConfig::default()).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["summary"], json!("short"));
        assert_eq!(llm.call_count(), 1);
        assert_eq!(result.tokens_used, 15);
    }

    #[tokio::test]
    async fn judge_feedback_steers_next_turn() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            text_response("I think I'm done"),
            tool_call_response(&[("set_output", json!({"key": "summary", "value": "ok"}))]),
        ]));
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("s", "Summarizer", NodeKind::EventLoop).with_outputs(["summary"]);
        let ctx = context(spec, &memory, Some(llm.clone() as Arc<dyn LlmClient>));

        let result = EventLoopNode::new(EventLoopConfig::default()).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert_eq!(llm.call_count(), 2);
        let second = llm.requests()[1].messages.last().unwrap().text();
        assert!(second.contains("summary"), "{}", second);
    }

    #[tokio::test]
    async fn unknown_output_key_is_a_tool_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("set_output", json!({"key": "other", "value": 1}))]),
            tool_call_response(&[("set_output", json!({"key": "summary", "value": 2}))]),
        ]));
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("s", "S", NodeKind::EventLoop).with_outputs(["summary"]);
        let ctx = context(spec, &memory, Some(llm.clone() as Arc<dyn LlmClient>));

        let result = EventLoopNode::new(EventLoopConfig::default()).execute(&ctx).await.unwrap();
        assert!(result.success);
        assert!(!result.output.contains_key("other"));
        let tool_msg = llm.requests()[1].messages.last().unwrap().clone();
        assert!(matches!(
            &tool_msg.content[0],
            ContentBlock::ToolResult { is_error: true, content, .. } if content.contains("Unknown output key")
        ));
    }

    #[tokio::test]
    async fn exhausted_iterations_fail_with_partial_output() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("set_output", json!({"key": "a", "value": 1}))]),
        ]));
        let memory = SharedMemory::new();
        let spec = NodeSpec::new("s", "S", NodeKind::EventLoop).with_outputs(["a", "b"]);
        let ctx = context(spec, &memory, Some(llm.clone() as Arc<dyn LlmClient>));
        let config = EventLoopConfig {
            max_iterations: 3,
            ..EventLoopConfig::default()
        };

        let result = EventLoopNode::new(config).execute(&ctx).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("missing: b"));
        assert_eq!(result.output["a"], json!(1));
        assert_eq!(llm.call_count(), 3);
    }

    fn subagent_ctx(llm: Arc<ScriptedLlm>, memory: &SharedMemory) -> NodeContext {
        let spec = NodeSpec::new("helper", "Helper", NodeKind::EventLoop).with_outputs(["findings"]);
        let mut ctx = context(spec, memory, Some(llm as Arc<dyn LlmClient>));
        ctx.is_subagent_mode = true;
        ctx.parent_node_id = Some("lead".into());
        ctx
    }

    #[tokio::test]
    async fn mark_complete_ends_loop_on_same_iteration() {
        let llm = Arc::new(ScriptedLlm::new(vec![tool_call_response(&[(
            "report_to_parent",
            json!({"message": "cannot find anything", "mark_complete": true}),
        )])]));
        let memory = SharedMemory::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut ctx = subagent_ctx(llm.clone(), &memory);
        let sink = seen.clone();
        ctx.report_callback = Some(Arc::new(move |r: &SubagentReport| -> Result<()> {
            sink.lock().unwrap().push(r.message.clone());
            Ok(())
        }));

        let node = EventLoopNode::new(EventLoopConfig::default()).with_judge(Arc::new(SubagentJudge));
        let outcome = node.run_loop(&ctx).await.unwrap();
        assert!(outcome.result.success);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), ["cannot find anything"]);
    }

    #[tokio::test]
    async fn report_without_mark_complete_needs_more_turns() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("report_to_parent", json!({"message": "halfway"}))]),
            tool_call_response(&[("set_output", json!({"key": "findings", "value": "x"}))]),
        ]));
        let memory = SharedMemory::new();
        let mut ctx = subagent_ctx(llm.clone(), &memory);
        ctx.report_callback = Some(noop_callback());

        let node = EventLoopNode::new(EventLoopConfig::default()).with_judge(Arc::new(SubagentJudge));
        let outcome = node.run_loop(&ctx).await.unwrap();
        assert!(outcome.result.success);
        assert_eq!(llm.call_count(), 2);
        assert_eq!(outcome.reports[0].message, "halfway");
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_completion() {
        let llm = Arc::new(ScriptedLlm::new(vec![tool_call_response(&[(
            "report_to_parent",
            json!({"message": "done", "mark_complete": true}),
        )])]));
        let memory = SharedMemory::new();
        let mut ctx = subagent_ctx(llm, &memory);
        ctx.report_callback = Some(Arc::new(|_: &SubagentReport| -> Result<()> {
            Err(WeaverError::Config("callback down".into()))
        }));

        let node = EventLoopNode::new(EventLoopConfig::default());
        let outcome = node.run_loop(&ctx).await.unwrap();
        assert!(outcome.result.success);
        assert_eq!(outcome.reports.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_response_without_bus_does_not_block() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("report_to_parent", json!({"message": "ok?", "wait_for_response": true}))]),
            tool_call_response(&[("set_output", json!({"key": "findings", "value": "x"}))]),
        ]));
        let memory = SharedMemory::new();
        let mut ctx = subagent_ctx(llm.clone(), &memory);
        ctx.report_callback = Some(noop_callback());

        let outcome = EventLoopNode::new(EventLoopConfig::default()).run_loop(&ctx).await.unwrap();
        assert!(outcome.result.success);
        assert!(ctx.escalations.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn escalation_reply_becomes_tool_result() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("report_to_parent", json!({"message": "Proceed?", "wait_for_response": true}))]),
            tool_call_response(&[("set_output", json!({"key": "findings", "value": "x"}))]),
        ]));
        let memory = SharedMemory::new();
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut ctx = subagent_ctx(llm.clone(), &memory);
        ctx.report_callback = Some(noop_callback());
        ctx.event_bus = Some(bus);

        let escalations = ctx.escalations.clone();
        let responder = tokio::spawn(async move {
            loop {
                if let AgentEvent::ClientInputRequested { escalation_id, .. } = rx.recv().await.unwrap() {
                    assert!(escalations.inject(&escalation_id, "yes, go"));
                    return escalation_id;
                }
            }
        });

        let outcome = EventLoopNode::new(EventLoopConfig::default()).run_loop(&ctx).await.unwrap();
        let escalation_id = responder.await.unwrap();
        assert!(outcome.result.success);
        assert!(!ctx.escalations.contains(&escalation_id));

        let tool_msg = llm.requests()[1].messages.last().unwrap().clone();
        assert!(matches!(
            &tool_msg.content[0],
            ContentBlock::ToolResult { content, is_error: false, .. } if content == "yes, go"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn escalation_timeout_reports_no_response() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            tool_call_response(&[("report_to_parent", json!({"message": "Anyone?", "wait_for_response": true}))]),
            tool_call_response(&[("set_output", json!({"key": "findings", "value": "x"}))]),
        ]));
        let memory = SharedMemory::new();
        let mut ctx = subagent_ctx(llm.clone(), &memory);
        ctx.report_callback = Some(noop_callback());
        ctx.event_bus = Some(Arc::new(EventBus::default()));
        let config = EventLoopConfig {
            escalation_timeout_secs: 5,
            ..EventLoopConfig::default()
        };

        let outcome = EventLoopNode::new(config).run_loop(&ctx).await.unwrap();
        assert!(outcome.result.success);
        assert!(ctx.escalations.pending_ids().is_empty());
        let tool_msg = llm.requests()[1].messages.last().unwrap().clone();
        assert!(matches!(
            &tool_msg.content[0],
            ContentBlock::ToolResult { is_error: true, content, .. } if content.contains("No response")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_wait_releases_escalation() {
        let llm = Arc::new(ScriptedLlm::new(vec![tool_call_response(&[(
            "report_to_parent",
            json!({"message": "Still there?", "wait_for_response": true}),
        )])]));
        let memory = SharedMemory::new();
        let mut ctx = subagent_ctx(llm, &memory);
        ctx.report_callback = Some(noop_callback());
        ctx.event_bus = Some(Arc::new(EventBus::default()));

        let node = EventLoopNode::new(EventLoopConfig::default());
        let waited = tokio::time::timeout(Duration::from_secs(1), node.run_loop(&ctx)).await;
        assert!(waited.is_err());
        assert!(ctx.escalations.pending_ids().is_empty());
    }

    #[test]
    fn truncate_long_output() {
        assert_eq!(truncate("short", 10), "short");
        let long = truncate(&"x".repeat(20), 5);
        assert!(long.starts_with("xxxxx\n"));
        assert!(long.ends_with("[output truncated]"));
    }
}
