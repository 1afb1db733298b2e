use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weaver_core::config::{EngineConfig, ModelConfig};
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventBus;
use weaver_core::goal::Goal;
use weaver_core::security::Severity;
use weaver_core::traits::LlmClient;
use weaver_core::types::{AgentEvent, RunId};
use weaver_tools::ToolRegistry;

use super::edge::{evaluate_condition, ConditionScope, EdgeCondition, EdgeSpec};
use super::node::{NodeKind, NodeSpec};
use super::result::{ExecutionResult, SessionState};
use super::spec::GraphSpec;
use crate::event_loop::{DefaultJudge, EscalationRegistry, EventLoopNode, Judge, LlmJudge};
use crate::guard::SecurityGuard;
use crate::llm_call::complete_text;
use crate::memory::SharedMemory;
use crate::node::{
    FunctionNode, FunctionRegistry, HumanInputNode, LlmNode, NodeContext, NodeProtocol, NodeResult,
    ReportCallback, RouterNode,
};
use crate::output_validator::{OutputCleaner, OutputValidator};
use crate::run_log::{RunTracker, TracingRunTracker};

/// Executes a workflow graph.
///
/// Starting from the entry node (or a resume point), it runs each node under
/// the security guard, applies retry, pause and terminal rules, and follows
/// the first outgoing edge whose condition holds. Every run returns an
/// [`ExecutionResult`]; failures never surface as `Err`.
pub struct GraphExecutor {
    llm: Option<Arc<dyn LlmClient>>,
    model: ModelConfig,
    tools: Arc<ToolRegistry>,
    functions: FunctionRegistry,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    tracker: Arc<dyn RunTracker>,
    judge: Option<Arc<dyn Judge>>,
    report_callback: Option<ReportCallback>,
    escalations: Arc<EscalationRegistry>,
    cancel: Mutex<CancellationToken>,
}

/// Bookkeeping for one run, folded into the final result.
struct RunProgress {
    run_id: RunId,
    cancel: CancellationToken,
    steps: usize,
    path: Vec<String>,
    total_tokens: u64,
    total_latency_ms: u64,
}

enum Outcome {
    Completed,
    Paused(SessionState),
    Failed(String),
}

impl GraphExecutor {
    /// Without a model client only function, human-input and single-route
    /// router nodes can run.
    pub fn new(llm: Option<Arc<dyn LlmClient>>, model: ModelConfig) -> Self {
        Self {
            llm,
            model,
            tools: Arc::new(ToolRegistry::new()),
            functions: FunctionRegistry::new(),
            config: EngineConfig::default(),
            event_bus: None,
            tracker: Arc::new(TracingRunTracker),
            judge: None,
            report_callback: None,
            escalations: Arc::new(EscalationRegistry::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    /// Executor, security and event-loop settings. The model passed to
    /// [`GraphExecutor::new`] is kept.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn RunTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Judge for every event-loop node, replacing the default choice.
    pub fn with_judge(mut self, judge: Arc<dyn Judge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Receives progress reports from delegated sub-agents.
    pub fn with_report_callback(mut self, callback: ReportCallback) -> Self {
        self.report_callback = Some(callback);
        self
    }

    /// Pending escalations of this executor's runs. Responses are injected here.
    pub fn escalations(&self) -> Arc<EscalationRegistry> {
        self.escalations.clone()
    }

    /// Cancelling this token stops the runs in flight at their next
    /// suspension point. Runs started afterwards get a fresh token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn run_token(&self) -> CancellationToken {
        let mut current = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.child_token()
    }

    /// Errors that stop `graph` from running with this executor's tools.
    pub fn validate(&self, graph: &GraphSpec, guard: &SecurityGuard) -> Vec<String> {
        let mut errors = graph.validate();
        for node in &graph.nodes {
            for tool in &node.tools {
                if !self.tools.contains(tool) {
                    errors.push(format!("Node '{}' declares unregistered tool '{}'", node.id, tool));
                }
            }
        }
        errors.extend(guard.validate_tool_names(
            graph
                .nodes
                .iter()
                .flat_map(|n| n.tools.iter().map(move |t| (n.id.as_str(), t.as_str()))),
        ));
        errors
    }

    /// Run `graph` for `goal`. Pass the `session_state` of a paused run to
    /// continue it.
    pub async fn execute(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        input_data: HashMap<String, Value>,
        session_state: Option<SessionState>,
    ) -> ExecutionResult {
        let run_id = RunId::new();
        let mut guard = SecurityGuard::new(self.config.security.clone());
        if let Some(bus) = &self.event_bus {
            guard = guard.with_event_bus(bus.clone());
        }

        let errors = self.validate(graph, &guard);
        if !errors.is_empty() {
            let err = WeaverError::GraphValidation(errors);
            error!(%run_id, graph = %graph.id, error = %err, "Graph rejected");
            self.tracker.report_problem(&run_id, Severity::High, &err.to_string(), None);
            self.publish(AgentEvent::RunError {
                run_id: run_id.clone(),
                error: err.to_string(),
            });
            let mut result = ExecutionResult::rejected(run_id, err.to_string());
            result.audit_log = guard.audit_log();
            return result;
        }

        info!(%run_id, graph = %graph.id, goal = %goal.description, "Starting graph run");
        self.tracker.start_run(&run_id, &goal.description, &input_data);
        self.publish(AgentEvent::RunStarted { run_id: run_id.clone() });

        let mut progress = RunProgress {
            run_id,
            cancel: self.run_token(),
            steps: 0,
            path: Vec::new(),
            total_tokens: 0,
            total_latency_ms: 0,
        };
        let memory = SharedMemory::new();

        let input = match guard.sanitize_input(&input_data) {
            Ok(clean) => clean,
            Err(e) => {
                self.tracker
                    .report_problem(&progress.run_id, Severity::Critical, &e.to_string(), None);
                return self.conclude(progress, &memory, &guard, Outcome::Failed(e.to_string()));
            }
        };

        let start_node = match &session_state {
            Some(state) => {
                memory.extend(state.memory.clone());
                let node = graph.resume_node(state);
                info!(run_id = %progress.run_id, paused_at = ?state.paused_at, resume_at = %node, "Resuming run");
                node
            }
            None => graph.entry_node.clone(),
        };
        memory.extend(input.clone());

        let outcome = self
            .run_steps(graph, goal, &input, &memory, &guard, &mut progress, start_node)
            .await;
        self.conclude(progress, &memory, &guard, outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        graph: &GraphSpec,
        goal: &Goal,
        input: &HashMap<String, Value>,
        memory: &SharedMemory,
        guard: &SecurityGuard,
        progress: &mut RunProgress,
        start_node: String,
    ) -> Outcome {
        let node_registry = Arc::new(graph.node_map());
        let validator = OutputValidator::new(&self.config.executor);
        let cleaner = match (&self.llm, self.config.executor.llm_output_repair) {
            (Some(llm), true) => OutputCleaner::new(llm.clone(), self.model.clone()),
            _ => OutputCleaner::heuristic_only(),
        };

        let mut current = start_node;
        let mut retries: HashMap<String, u32> = HashMap::new();

        loop {
            if progress.steps >= graph.max_steps {
                warn!(run_id = %progress.run_id, max_steps = graph.max_steps, "Step budget exhausted");
                return Outcome::Failed(format!("max steps exceeded ({})", graph.max_steps));
            }
            progress.steps += 1;

            if progress.cancel.is_cancelled() {
                return Outcome::Failed(WeaverError::Cancelled.to_string());
            }
            if let Err(e) = guard.check_resources(memory) {
                self.tracker
                    .report_problem(&progress.run_id, Severity::Critical, &e.to_string(), Some(&current));
                return Outcome::Failed(e.to_string());
            }

            let Some(spec) = node_registry.get(&current) else {
                return Outcome::Failed(WeaverError::NodeNotFound(current).to_string());
            };
            let attempt = retries.get(&spec.id).copied().unwrap_or(0) + 1;
            if attempt == 1 {
                progress.path.push(spec.id.clone());
            }

            let protocol = match self.resolve_node(spec) {
                Ok(p) => p,
                Err(e) => {
                    error!(node_id = %spec.id, error = %e, "Cannot resolve node");
                    self.tracker
                        .report_problem(&progress.run_id, Severity::High, &e.to_string(), Some(&spec.id));
                    return Outcome::Failed(e.to_string());
                }
            };

            let ctx = self.build_context(
                progress,
                spec,
                memory,
                input,
                goal,
                &node_registry,
                attempt,
            );
            for warning in protocol.validate_input(&ctx) {
                warn!(node_id = %spec.id, "{}", warning);
            }

            info!(node_id = %spec.id, node_name = %spec.name, attempt, "Executing node");
            self.publish(AgentEvent::NodeStarted {
                node_id: spec.id.clone(),
                attempt,
            });
            let node_start = Instant::now();
            let mut result = match guard.run_with_timeout(&spec.id, protocol.execute(&ctx)).await {
                Ok(Ok(result)) => result,
                Ok(Err(WeaverError::Cancelled)) => return Outcome::Failed(WeaverError::Cancelled.to_string()),
                Ok(Err(e)) => NodeResult::failure(e.to_string()),
                Err(timeout) => NodeResult::failure(timeout.to_string()),
            };
            let latency_ms = node_start.elapsed().as_millis() as u64;
            progress.total_tokens += result.tokens_used;
            progress.total_latency_ms += latency_ms;

            if result.success && !spec.output_keys.is_empty() && protocol.kind() != NodeKind::HumanInput {
                result = self
                    .check_node_output(&validator, &cleaner, spec, result)
                    .await;
            }

            self.publish(AgentEvent::NodeCompleted {
                node_id: spec.id.clone(),
                success: result.success,
                latency_ms,
            });

            if !result.success {
                let err = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
                let count = retries.entry(spec.id.clone()).or_insert(0);
                *count += 1;
                if *count < spec.max_retries {
                    warn!(node_id = %spec.id, attempt = *count, max_retries = spec.max_retries, error = %err, "Node failed, retrying");
                    // Retries do not consume the step budget.
                    progress.steps -= 1;
                    continue;
                }

                let message = format!("Node '{}' failed after {} attempts: {}", spec.name, count, err);
                error!(node_id = %spec.id, "{}", message);
                self.tracker
                    .report_problem(&progress.run_id, Severity::High, &message, Some(&spec.id));

                let snapshot = memory.read_all();
                let failure_edge = self
                    .select_edge(graph, spec, &result, &snapshot, goal, true)
                    .await;
                match failure_edge {
                    Some(edge) => {
                        info!(node_id = %spec.id, target = %edge.target, "Following failure edge");
                        retries.remove(&spec.id);
                        memory.extend(edge.map_inputs(&result.output, &snapshot));
                        current = edge.target.clone();
                        continue;
                    }
                    None => return Outcome::Failed(message),
                }
            }
            retries.remove(&spec.id);

            for key in &spec.output_keys {
                if let Some(value) = result.output.get(key) {
                    if let Err(e) = ctx.memory.write(key, value.clone()) {
                        warn!(node_id = %spec.id, key = %key, error = %e, "Output not written to memory");
                    }
                }
            }

            if graph.pause_nodes.contains(&spec.id) {
                let snapshot = memory.read_all();
                let resume_from = self.resume_target(graph, spec, &result, &snapshot, goal).await;
                info!(node_id = %spec.id, resume_from = ?resume_from, "Pausing run");
                return Outcome::Paused(SessionState {
                    paused_at: Some(spec.id.clone()),
                    resume_from,
                    memory: snapshot,
                });
            }

            if graph.terminal_nodes.contains(&spec.id) {
                debug!(node_id = %spec.id, "Reached terminal node");
                return Outcome::Completed;
            }

            if let Some(next) = result.next_node.take() {
                debug!(node_id = %spec.id, next = %next, "Node chose its successor");
                current = next;
                continue;
            }

            let snapshot = memory.read_all();
            let Some(edge) = self
                .select_edge(graph, spec, &result, &snapshot, goal, false)
                .await
            else {
                debug!(node_id = %spec.id, "No edge matched, run complete");
                return Outcome::Completed;
            };

            let target = match node_registry.get(&edge.target) {
                Some(t) => t,
                None => return Outcome::Failed(WeaverError::NodeNotFound(edge.target.clone()).to_string()),
            };
            let output = self
                .prepare_edge_output(&validator, &cleaner, spec, target, &result.output, memory)
                .await;
            let mapped = edge.map_inputs(&output, &snapshot);
            if !mapped.is_empty() {
                debug!(edge = %edge.id, keys = mapped.len(), "Applying input mapping");
                memory.extend(mapped);
            }
            current = edge.target.clone();
        }
    }

    /// Pick the node implementation for `spec`.
    fn resolve_node(&self, spec: &NodeSpec) -> Result<Box<dyn NodeProtocol>> {
        let kind = spec.node_kind()?;
        let node: Box<dyn NodeProtocol> = match kind {
            NodeKind::LlmToolUse => {
                if spec.tools.is_empty() {
                    return Err(WeaverError::NodeConfig {
                        node: spec.id.clone(),
                        message: "llm_tool_use nodes must declare at least one tool".to_string(),
                    });
                }
                Box::new(LlmNode::tool_use())
            }
            NodeKind::LlmGenerate => Box::new(LlmNode::generate()),
            NodeKind::Router => Box::new(RouterNode),
            NodeKind::Function => {
                let func = self
                    .functions
                    .get(&spec.id)
                    .ok_or_else(|| WeaverError::UnregisteredFunction(spec.id.clone()))?;
                Box::new(FunctionNode::new(func))
            }
            NodeKind::EventLoop => {
                Box::new(EventLoopNode::new(self.config.event_loop.clone()).with_judge(self.judge_for(spec)))
            }
            NodeKind::HumanInput => Box::new(HumanInputNode),
        };
        Ok(node)
    }

    fn judge_for(&self, spec: &NodeSpec) -> Arc<dyn Judge> {
        if let Some(judge) = &self.judge {
            return judge.clone();
        }
        match (&self.llm, &spec.success_criteria) {
            (Some(llm), Some(criteria)) if !criteria.trim().is_empty() => {
                Arc::new(LlmJudge::new(llm.clone(), self.model.clone()))
            }
            _ => Arc::new(DefaultJudge),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_context(
        &self,
        progress: &RunProgress,
        spec: &NodeSpec,
        memory: &SharedMemory,
        input: &HashMap<String, Value>,
        goal: &Goal,
        node_registry: &Arc<HashMap<String, NodeSpec>>,
        attempt: u32,
    ) -> NodeContext {
        let read_keys: Vec<String> = spec.input_keys.iter().chain(&spec.output_keys).cloned().collect();
        NodeContext {
            run_id: progress.run_id.clone(),
            node_id: spec.id.clone(),
            spec: spec.clone(),
            memory: memory.with_permissions(spec.id.clone(), read_keys, spec.output_keys.clone()),
            input_data: input.clone(),
            llm: self.llm.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            available_tools: self.tools.definitions_for(&spec.tools),
            goal: goal.clone(),
            event_bus: self.event_bus.clone(),
            node_registry: node_registry.clone(),
            is_subagent_mode: false,
            parent_node_id: None,
            report_callback: self.report_callback.clone(),
            escalations: self.escalations.clone(),
            cancel: progress.cancel.child_token(),
            attempt,
        }
    }

    /// Validate a successful node's output against its declared keys. Output
    /// that still fails after cleaning turns the result into a failure.
    async fn check_node_output(
        &self,
        validator: &OutputValidator,
        cleaner: &OutputCleaner,
        spec: &NodeSpec,
        result: NodeResult,
    ) -> NodeResult {
        let validation = validator.validate_all(&result.output, &spec.output_keys);
        if validation.success() {
            return result;
        }

        warn!(node_id = %spec.id, error = %validation.error(), "Output failed validation, cleaning");
        let cleaned = cleaner
            .clean(&result.output, &spec.output_keys, &validation.errors)
            .await;
        let revalidated = validator.validate_all(&cleaned, &spec.output_keys);
        if revalidated.success() {
            debug!(node_id = %spec.id, "Output cleaned");
            return NodeResult {
                output: cleaned,
                ..result
            };
        }

        NodeResult::failure(format!("Output validation failed: {}", revalidated.error()))
            .with_output(cleaned)
            .with_tokens(result.tokens_used)
    }

    /// Clean `output` for the keys `target` consumes and write the cleaned
    /// values. Output that still fails validation is logged and used anyway.
    async fn prepare_edge_output(
        &self,
        validator: &OutputValidator,
        cleaner: &OutputCleaner,
        source: &NodeSpec,
        target: &NodeSpec,
        output: &HashMap<String, Value>,
        memory: &SharedMemory,
    ) -> HashMap<String, Value> {
        let validation = validator.validate_output(output, &source.id, target);
        if validation.success() {
            return output.clone();
        }

        warn!(source = %source.id, target = %target.id, error = %validation.error(), "Output invalid for target, cleaning");
        let cleaned = cleaner
            .clean_output(output, &source.id, target, &validation.errors)
            .await;
        let revalidated = validator.validate_output(&cleaned, &source.id, target);
        if !revalidated.success() {
            warn!(
                source = %source.id,
                target = %target.id,
                error = %revalidated.error(),
                "Output still invalid after cleaning, continuing"
            );
        }

        for key in &target.input_keys {
            if let Some(value) = cleaned.get(key) {
                memory.write(key.clone(), value.clone());
            }
        }
        cleaned
    }

    /// First outgoing edge, by priority then declaration order, whose
    /// condition holds. With `failure_only`, only `on_failure` edges count.
    async fn select_edge<'g>(
        &self,
        graph: &'g GraphSpec,
        spec: &NodeSpec,
        result: &NodeResult,
        memory: &HashMap<String, Value>,
        goal: &Goal,
        failure_only: bool,
    ) -> Option<&'g EdgeSpec> {
        for edge in graph.outgoing_edges(&spec.id) {
            if failure_only && !matches!(edge.condition, EdgeCondition::OnFailure) {
                continue;
            }
            let matched = match &edge.condition {
                EdgeCondition::Always => true,
                EdgeCondition::OnSuccess => result.success,
                EdgeCondition::OnFailure => !result.success,
                EdgeCondition::Conditional { expr } => evaluate_condition(
                    expr,
                    &ConditionScope {
                        success: result.success,
                        output: &result.output,
                        memory,
                    },
                ),
                EdgeCondition::LlmDecide { prompt } => {
                    self.evaluate_llm_edge(prompt, goal, &result.output, memory).await
                }
            };
            if matched {
                debug!(edge = %edge.id, "Edge matched");
                return Some(edge);
            }
        }
        None
    }

    /// Ask the model whether to traverse an edge. Any failure means no.
    async fn evaluate_llm_edge(
        &self,
        prompt: &str,
        goal: &Goal,
        output: &HashMap<String, Value>,
        memory: &HashMap<String, Value>,
    ) -> bool {
        let Some(llm) = &self.llm else {
            warn!("llm_decide edge but no model configured, skipping");
            return false;
        };

        let mut context = memory.clone();
        context.extend(output.clone());
        let mut lines: Vec<String> = context.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
        lines.sort();

        let full_prompt = format!(
            "Goal: {}\n\n{}\n\nContext:\n{}\n\nRespond with ONLY \"yes\" or \"no\".",
            goal.description,
            prompt,
            lines.join("\n")
        );

        match complete_text(llm.as_ref(), &self.model, None, full_prompt).await {
            Ok((response, _)) => response.trim().to_lowercase().starts_with("yes"),
            Err(e) => {
                warn!(error = %e, "llm_decide edge evaluation failed, defaulting to no");
                false
            }
        }
    }

    /// Where a run paused at `spec` should continue: the `<node>_resume`
    /// entry point when declared, else the first matching edge's target.
    async fn resume_target(
        &self,
        graph: &GraphSpec,
        spec: &NodeSpec,
        result: &NodeResult,
        memory: &HashMap<String, Value>,
        goal: &Goal,
    ) -> Option<String> {
        let entry = format!("{}_resume", spec.id);
        if graph.entry_points.contains_key(&entry) {
            return Some(entry);
        }
        if let Some(next) = &result.next_node {
            return Some(next.clone());
        }
        self.select_edge(graph, spec, result, memory, goal, false)
            .await
            .map(|edge| edge.target.clone())
    }

    fn conclude(
        &self,
        progress: RunProgress,
        memory: &SharedMemory,
        guard: &SecurityGuard,
        outcome: Outcome,
    ) -> ExecutionResult {
        let output = memory.read_all();
        let route = progress.path.join(" -> ");
        let (success, error, session_state, narrative) = match outcome {
            Outcome::Completed => (
                true,
                None,
                None,
                format!("Run completed in {} steps: {}", progress.steps, route),
            ),
            Outcome::Paused(state) => {
                let narrative = format!(
                    "Run paused at '{}' after {} steps: {}",
                    state.paused_at.as_deref().unwrap_or_default(),
                    progress.steps,
                    route
                );
                (true, None, Some(state), narrative)
            }
            Outcome::Failed(error) => {
                let narrative = format!("Run failed after {} steps: {}", progress.steps, error);
                (false, Some(error), None, narrative)
            }
        };

        self.tracker.end_run(&progress.run_id, success, &output, &narrative);
        let paused_at = session_state.as_ref().and_then(|s| s.paused_at.clone());
        match &error {
            Some(error) => self.publish(AgentEvent::RunError {
                run_id: progress.run_id.clone(),
                error: error.clone(),
            }),
            None => self.publish(AgentEvent::RunComplete {
                run_id: progress.run_id.clone(),
                steps: progress.steps,
                total_tokens: progress.total_tokens,
                paused_at: paused_at.clone(),
            }),
        }

        ExecutionResult {
            run_id: progress.run_id,
            success,
            output,
            error,
            steps_executed: progress.steps,
            total_tokens: progress.total_tokens,
            total_latency_ms: progress.total_latency_ms,
            path: progress.path,
            paused_at,
            session_state,
            audit_log: guard.audit_log(),
        }
    }

    fn publish(&self, event: AgentEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
