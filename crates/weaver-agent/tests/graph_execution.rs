use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weaver_agent::graph::{EdgeSpec, GraphExecutor, GraphSpec, NodeKind, NodeSpec, SessionState};
use weaver_agent::node::{FunctionRegistry, NodeFunction};
use weaver_agent::run_log::RunTracker;
use weaver_agent::{SharedMemory, ViolationKind};
use weaver_core::config::{EngineConfig, ModelConfig};
use weaver_core::error::{Result, WeaverError};
use weaver_core::goal::Goal;
use weaver_core::security::Severity;
use weaver_core::traits::LlmClient;
use weaver_core::types::RunId;
use weaver_test_utils::{text_response, EchoTool, ScriptedLlm};
use weaver_tools::ToolRegistry;

type Map = HashMap<String, Value>;

fn map(value: Value) -> Map {
    value
        .as_object()
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default()
}

fn function(id: &str) -> NodeSpec {
    NodeSpec::new(id, id.to_uppercase(), NodeKind::Function)
}

fn executor(functions: FunctionRegistry) -> GraphExecutor {
    GraphExecutor::new(None, ModelConfig::default()).with_functions(functions)
}

fn counted(registry: &mut FunctionRegistry, id: &str, output: Value) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    registry.register_fn(id, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(map(output.clone()))
    });
    calls
}

#[tokio::test]
async fn exhausted_retries_end_the_run_without_consuming_steps() {
    let mut registry = FunctionRegistry::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    registry.register_fn("A", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(WeaverError::Config("upstream down".into()))
    });
    let b_calls = counted(&mut registry, "B", json!({}));

    let graph = GraphSpec::new("retry", "A")
        .with_node(function("A").with_max_retries(2))
        .with_node(function("B"))
        .with_edge(EdgeSpec::always("A", "B"));

    let result = executor(registry)
        .execute(&graph, &Goal::new("retry"), HashMap::new(), None)
        .await;

    assert!(!result.success);
    assert_eq!(result.steps_executed, 1);
    assert_eq!(result.path, vec!["A"]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    let error = result.error.unwrap();
    assert!(error.contains("2 attempts"), "{}", error);
    assert!(error.contains("upstream down"), "{}", error);
}

#[tokio::test]
async fn failure_edge_is_followed_once_retries_run_out() {
    let mut registry = FunctionRegistry::new();
    registry.register_fn("fetch", |_| Err(WeaverError::Config("404".into())));
    let recover_calls = counted(&mut registry, "recover", json!({"note": "used cache"}));

    let graph = GraphSpec::new("g", "fetch")
        .with_node(function("fetch").with_max_retries(1))
        .with_node(function("recover").with_outputs(["note"]))
        .with_edge(EdgeSpec::on_success("fetch", "recover").with_priority(5))
        .with_edge(EdgeSpec::on_failure("fetch", "recover"));

    let result = executor(registry)
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(result.success);
    assert_eq!(result.path, vec!["fetch", "recover"]);
    assert_eq!(recover_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.output["note"], json!("used cache"));
}

fn review_graph() -> GraphSpec {
    GraphSpec::new("review", "draft")
        .with_node(function("draft").with_inputs(["topic"]).with_outputs(["text"]))
        .with_node(NodeSpec::new("review", "Review", NodeKind::HumanInput).with_outputs(["approval"]))
        .with_node(function("publish").with_inputs(["text", "approval"]).with_outputs(["url"]))
        .with_edge(EdgeSpec::on_success("draft", "review"))
        .with_edge(EdgeSpec::on_success("review", "publish"))
        .with_pause_node("review")
}

fn review_functions(seen: Arc<Mutex<Option<Map>>>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register_fn("draft", |inputs| {
        let topic = inputs.get("topic").and_then(Value::as_str).unwrap_or("?").to_string();
        Ok(map(json!({"text": format!("All about {}", topic)})))
    });
    registry.register_fn("publish", move |inputs| {
        *seen.lock().unwrap() = Some(inputs);
        Ok(map(json!({"url": "https://example.org/post"})))
    });
    registry
}

#[tokio::test]
async fn pause_then_resume_from_derived_node() {
    let seen = Arc::new(Mutex::new(None));
    let graph = review_graph();
    let exec = executor(review_functions(seen.clone()));

    let first = exec
        .execute(&graph, &Goal::new("blog"), map(json!({"topic": "rust"})), None)
        .await;
    assert!(first.success);
    assert_eq!(first.paused_at.as_deref(), Some("review"));
    assert_eq!(first.path, vec!["draft", "review"]);
    let state = first.session_state.clone().unwrap();
    assert_eq!(state.memory, first.output);
    assert_eq!(state.memory["text"], json!("All about rust"));
    assert_eq!(state.resume_from.as_deref(), Some("publish"));
    assert!(seen.lock().unwrap().is_none());

    let second = exec
        .execute(&graph, &Goal::new("blog"), map(json!({"approval": "ship it"})), Some(state))
        .await;
    assert!(second.success);
    assert!(!second.is_paused());
    assert_eq!(second.path, vec!["publish"]);
    assert_eq!(second.output["url"], json!("https://example.org/post"));

    let inputs = seen.lock().unwrap().clone().unwrap();
    assert_eq!(inputs["text"], json!("All about rust"));
    assert_eq!(inputs["approval"], json!("ship it"));
}

#[tokio::test]
async fn resume_entry_point_takes_precedence() {
    let graph = review_graph().with_entry_point("review_resume", "publish");
    let exec = executor(review_functions(Arc::new(Mutex::new(None))));

    let paused = exec
        .execute(&graph, &Goal::new("blog"), map(json!({"topic": "go"})), None)
        .await;
    let state = paused.session_state.unwrap();
    assert_eq!(state.resume_from.as_deref(), Some("review_resume"));
    assert_eq!(graph.resume_node(&state), "publish");

    let saved = SessionState {
        resume_from: None,
        ..state
    };
    // Without resume_from the paused node's resume entry point is used.
    assert_eq!(graph.resume_node(&saved), "publish");
}

#[tokio::test]
async fn router_overrides_edges() {
    let llm = Arc::new(ScriptedLlm::new(vec![text_response("reject")]));
    let mut registry = FunctionRegistry::new();
    let ship = counted(&mut registry, "ship", json!({}));
    let fix = counted(&mut registry, "fix", json!({}));

    let graph = GraphSpec::new("g", "triage")
        .with_node(
            NodeSpec::new("triage", "Triage", NodeKind::Router)
                .with_outputs(["decision"])
                .with_route("approve", "ship")
                .with_route("reject", "fix"),
        )
        .with_node(function("ship"))
        .with_node(function("fix"))
        .with_edge(EdgeSpec::always("triage", "ship"))
        .with_terminal_node("fix");

    let result = GraphExecutor::new(Some(llm as Arc<dyn LlmClient>), ModelConfig::default())
        .with_functions(registry)
        .execute(&graph, &Goal::new("review the PR"), HashMap::new(), None)
        .await;
    assert!(result.success);
    assert_eq!(result.path, vec!["triage", "fix"]);
    assert_eq!(result.output["decision"], json!("reject"));
    assert_eq!(ship.load(Ordering::SeqCst), 0);
    assert_eq!(fix.load(Ordering::SeqCst), 1);
    assert_eq!(result.total_tokens, 15);
}

#[tokio::test]
async fn conditional_edges_and_input_mapping() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut registry = FunctionRegistry::new();
    registry.register_fn("score", |_| Ok(map(json!({"score": 0.92, "draft": "v1"}))));
    let revise = counted(&mut registry, "revise", json!({}));
    registry.register_fn("publish", move |inputs| {
        *sink.lock().unwrap() = Some(inputs);
        Ok(HashMap::new())
    });

    let graph = GraphSpec::new("g", "score")
        .with_node(function("score").with_outputs(["score", "draft"]))
        .with_node(function("revise"))
        .with_node(function("publish").with_inputs(["body"]))
        .with_edge(EdgeSpec::always("score", "revise"))
        .with_edge(
            EdgeSpec::conditional("score", "publish", "output.score >= 0.8 and success")
                .with_priority(10)
                .with_mapping("body", "draft"),
        );

    let result = executor(registry)
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(result.success);
    assert_eq!(result.path, vec!["score", "publish"]);
    assert_eq!(revise.load(Ordering::SeqCst), 0);
    assert_eq!(result.output["body"], json!("v1"));
    assert_eq!(seen.lock().unwrap().clone().unwrap()["body"], json!("v1"));
}

#[tokio::test]
async fn nodes_only_see_declared_keys() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut registry = FunctionRegistry::new();
    registry.register_fn("a", |_| Ok(map(json!({"public": 1, "private": 2}))));
    registry.register_fn("b", move |inputs| {
        *sink.lock().unwrap() = Some(inputs);
        Ok(HashMap::new())
    });

    let graph = GraphSpec::new("g", "a")
        .with_node(function("a").with_outputs(["public"]))
        .with_node(function("b").with_inputs(["public", "private", "api_key"]))
        .with_edge(EdgeSpec::always("a", "b"));

    let result = executor(registry)
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(result.success);
    // Undeclared output never reaches memory.
    assert!(!result.output.contains_key("private"));
    let inputs = seen.lock().unwrap().clone().unwrap();
    assert_eq!(inputs.get("public"), Some(&json!(1)));
    assert!(!inputs.contains_key("private"));
    assert!(!inputs.contains_key("api_key"));
}

#[test]
fn scoped_view_denies_undeclared_reads() {
    let memory = SharedMemory::new();
    memory.write("k", json!("v"));
    let view = memory.with_permissions("n", Vec::<String>::new(), vec!["out"]);
    assert_eq!(view.read("k"), None);
    assert_eq!(memory.read("k"), Some(json!("v")));
    assert!(view.write("k", json!("x")).is_err());
    view.write("out", json!(1)).unwrap();
    assert_eq!(memory.read("out"), Some(json!(1)));
}

struct SlowOnce {
    calls: AtomicUsize,
}

impl NodeFunction for SlowOnce {
    fn call(&self, _inputs: Map) -> BoxFuture<'_, Result<Map>> {
        let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
        Box::pin(async move {
            if first {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(map(json!({"done": true})))
        })
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_is_a_retryable_failure() {
    let slow = Arc::new(SlowOnce {
        calls: AtomicUsize::new(0),
    });
    let mut registry = FunctionRegistry::new();
    registry.register("work", slow.clone());

    let mut config = EngineConfig::default();
    config.security.max_execution_time_secs = 5;
    let graph = GraphSpec::new("g", "work").with_node(function("work").with_outputs(["done"]));

    let result = executor(registry)
        .with_config(config)
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(slow.calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.steps_executed, 1);
    let timeout = result
        .audit_log
        .iter()
        .find(|e| e.kind == ViolationKind::ExecutionTimeout)
        .unwrap();
    assert_eq!(timeout.severity, Severity::High);
    assert_eq!(timeout.node_id.as_deref(), Some("work"));
}

#[tokio::test]
async fn resource_ceiling_is_fatal_and_skips_retries() {
    let mut registry = FunctionRegistry::new();
    let first = counted(&mut registry, "first", json!({"blob": "x".repeat(200)}));
    let second = counted(&mut registry, "second", json!({}));

    let mut config = EngineConfig::default();
    config.security.max_memory_bytes = 100;
    let graph = GraphSpec::new("g", "first")
        .with_node(function("first").with_outputs(["blob"]))
        .with_node(function("second").with_max_retries(5))
        .with_edge(EdgeSpec::always("first", "second"));

    let result = executor(registry)
        .with_config(config)
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Resource limit"));
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn critical_input_aborts_before_any_node() {
    let mut registry = FunctionRegistry::new();
    let calls = counted(&mut registry, "a", json!({}));
    let graph = GraphSpec::new("g", "a").with_node(function("a"));

    let result = executor(registry)
        .execute(
            &graph,
            &Goal::new("g"),
            map(json!({"query": "x'; DROP TABLE users; --"})),
            None,
        )
        .await;
    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(result.path.is_empty());
    assert!(result.error.unwrap().contains("SQL drop"));
}

#[tokio::test]
async fn non_critical_input_is_dropped_and_run_continues() {
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    let mut registry = FunctionRegistry::new();
    registry.register_fn("a", move |inputs| {
        *sink.lock().unwrap() = Some(inputs);
        Ok(HashMap::new())
    });
    let graph = GraphSpec::new("g", "a").with_node(function("a").with_inputs(["note", "topic"]));

    let result = executor(registry)
        .execute(
            &graph,
            &Goal::new("g"),
            map(json!({"note": "<script>alert(1)</script>", "topic": "rust"})),
            None,
        )
        .await;
    assert!(result.success);
    let inputs = seen.lock().unwrap().clone().unwrap();
    assert!(!inputs.contains_key("note"));
    assert_eq!(inputs["topic"], json!("rust"));
    assert_eq!(result.audit_log.len(), 1);
}

#[tokio::test]
async fn invalid_graph_never_executes() {
    let mut registry = FunctionRegistry::new();
    let calls = counted(&mut registry, "a", json!({}));
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    let graph = GraphSpec::new("g", "a")
        .with_node(function("a").with_tools(["echo", "missing_tool", "exec_shell"]))
        .with_edge(EdgeSpec::always("a", "nowhere"));

    let result = executor(registry)
        .with_tools(Arc::new(tools))
        .execute(&graph, &Goal::new("g"), HashMap::new(), None)
        .await;
    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.steps_executed, 0);
    let error = result.error.unwrap();
    assert!(error.contains("nowhere"));
    assert!(error.contains("missing_tool"));
    assert!(error.contains("exec_shell"));
    assert!(result
        .audit_log
        .iter()
        .any(|e| e.kind == ViolationKind::DangerousTool));
}

#[derive(Default)]
struct RecordingTracker {
    calls: Mutex<Vec<String>>,
}

impl RunTracker for RecordingTracker {
    fn start_run(&self, _run_id: &RunId, goal: &str, _input: &Map) {
        self.calls.lock().unwrap().push(format!("start:{}", goal));
    }

    fn end_run(&self, _run_id: &RunId, success: bool, _output: &Map, _narrative: &str) {
        self.calls.lock().unwrap().push(format!("end:{}", success));
    }

    fn report_problem(&self, _run_id: &RunId, severity: Severity, _description: &str, node_id: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("problem:{}:{}", severity, node_id.unwrap_or("-")));
    }
}

#[tokio::test]
async fn tracker_sees_lifecycle_and_problems() {
    let tracker = Arc::new(RecordingTracker::default());
    let mut registry = FunctionRegistry::new();
    registry.register_fn("a", |_| Err(WeaverError::Config("nope".into())));
    let graph = GraphSpec::new("g", "a").with_node(function("a").with_max_retries(1));

    let result = executor(registry)
        .with_tracker(tracker.clone())
        .execute(&graph, &Goal::new("track me"), HashMap::new(), None)
        .await;
    assert!(!result.success);

    let calls = tracker.calls.lock().unwrap().clone();
    assert_eq!(calls.first().map(String::as_str), Some("start:track me"));
    assert!(calls.iter().any(|c| c.starts_with("problem:") && c.ends_with(":a")));
    assert_eq!(calls.last().map(String::as_str), Some("end:false"));
}
