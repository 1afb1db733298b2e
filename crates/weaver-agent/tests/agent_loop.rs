use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use weaver_agent::graph::{EdgeSpec, GraphExecutor, GraphSpec, NodeKind, NodeSpec};
use weaver_agent::node::{FunctionRegistry, SubagentReport};
use weaver_core::config::ModelConfig;
use weaver_core::event::EventBus;
use weaver_core::goal::Goal;
use weaver_core::traits::LlmClient;
use weaver_core::types::{AgentEvent, ContentBlock};
use weaver_test_utils::{text_response, tool_call_response, EchoTool, ScriptedLlm};
use weaver_tools::ToolRegistry;

fn tools() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    Arc::new(registry)
}

fn research_graph() -> GraphSpec {
    GraphSpec::new("research", "lead")
        .with_node(
            NodeSpec::new("lead", "Lead", NodeKind::EventLoop)
                .with_inputs(["topic"])
                .with_outputs(["summary"])
                .with_tools(["echo"])
                .with_sub_agents(["scout"]),
        )
        .with_node(
            NodeSpec::new("scout", "Scout", NodeKind::EventLoop)
                .with_outputs(["sources"])
                .with_sub_agents(["lead"]),
        )
        .with_node(NodeSpec::new("store", "Store", NodeKind::Function).with_inputs(["summary"]))
        .with_edge(EdgeSpec::on_success("lead", "store"))
        .with_terminal_node("store")
}

fn store_function(seen: Arc<Mutex<Option<HashMap<String, Value>>>>) -> FunctionRegistry {
    let mut functions = FunctionRegistry::new();
    functions.register_fn("store", move |inputs| {
        *seen.lock().unwrap() = Some(inputs);
        Ok(HashMap::new())
    });
    functions
}

#[tokio::test]
async fn event_loop_delegates_and_reports_through_the_graph() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        // lead, turn 1
        tool_call_response(&[
            ("echo", json!({"text": "checking"})),
            ("delegate_to_sub_agent", json!({"agent_id": "scout", "task": "list sources on rust"})),
        ]),
        // scout, turn 1
        tool_call_response(&[(
            "report_to_parent",
            json!({"message": "found two", "data": {"n": 2}}),
        )]),
        // scout, turn 2
        tool_call_response(&[("set_output", json!({"key": "sources", "value": ["a", "b"]}))]),
        // lead, turn 2
        tool_call_response(&[("set_output", json!({"key": "summary", "value": "two sources"}))]),
    ]));
    let reports: Arc<Mutex<Vec<SubagentReport>>> = Arc::default();
    let sink = reports.clone();
    let seen = Arc::new(Mutex::new(None));
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();

    let result = GraphExecutor::new(Some(llm.clone() as Arc<dyn LlmClient>), ModelConfig::default())
        .with_tools(tools())
        .with_functions(store_function(seen.clone()))
        .with_event_bus(bus)
        .with_report_callback(Arc::new(move |r: &SubagentReport| -> weaver_core::error::Result<()> {
            sink.lock().unwrap().push(r.clone());
            Ok(())
        }))
        .execute(
            &research_graph(),
            &Goal::new("summarize rust sources"),
            HashMap::from([("topic".to_string(), json!("rust"))]),
            None,
        )
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.path, vec!["lead", "store"]);
    assert_eq!(result.output["summary"], json!("two sources"));
    assert_eq!(result.total_tokens, 60);
    assert_eq!(seen.lock().unwrap().clone().unwrap()["summary"], json!("two sources"));
    // Sub-agent output does not leak into the run's memory.
    assert!(!result.output.contains_key("sources"));

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subagent_id, "scout");
    assert_eq!(reports[0].data, Some(json!({"n": 2})));

    let requests = llm.requests();
    assert!(requests[0].tool_names.contains(&"delegate_to_sub_agent".to_string()));
    // The scout may not delegate further, even though it declares sub-agents.
    assert!(!requests[1].tool_names.contains(&"delegate_to_sub_agent".to_string()));
    assert!(requests[1].tool_names.contains(&"report_to_parent".to_string()));

    let delegation = requests[3].messages.last().unwrap().clone();
    let ContentBlock::ToolResult { content, is_error, .. } = &delegation.content[1] else {
        panic!("expected the delegation result");
    };
    assert!(!is_error);
    let body: Value = serde_json::from_str(content).unwrap();
    assert_eq!(body["data"]["sources"], json!(["a", "b"]));
    assert_eq!(body["metadata"]["report_count"], json!(1));
    assert_eq!(body["reports"][0]["message"], json!("found two"));

    let mut saw_report_event = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEvent::SubagentReport {
            node_id, subagent_id, ..
        } = event
        {
            assert_eq!(node_id, "lead");
            assert_eq!(subagent_id, "scout");
            saw_report_event = true;
        }
    }
    assert!(saw_report_event);
}

#[tokio::test]
async fn escalation_is_answered_through_the_executor_registry() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        tool_call_response(&[("delegate_to_sub_agent", json!({"agent_id": "scout", "task": "ask first"}))]),
        tool_call_response(&[(
            "report_to_parent",
            json!({"message": "Include paywalled sources?", "wait_for_response": true}),
        )]),
        tool_call_response(&[("set_output", json!({"key": "sources", "value": []}))]),
        tool_call_response(&[("set_output", json!({"key": "summary", "value": "free only"}))]),
    ]));
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();

    let executor = GraphExecutor::new(Some(llm.clone() as Arc<dyn LlmClient>), ModelConfig::default())
        .with_tools(tools())
        .with_functions(store_function(Arc::new(Mutex::new(None))))
        .with_event_bus(bus)
        .with_report_callback(Arc::new(|_: &SubagentReport| -> weaver_core::error::Result<()> { Ok(()) }));

    let escalations = executor.escalations();
    let responder = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(AgentEvent::ClientInputRequested {
                    escalation_id, prompt, ..
                }) => {
                    assert_eq!(prompt, "Include paywalled sources?");
                    assert!(escalation_id.starts_with("scout:escalation:"));
                    assert!(escalations.inject(&escalation_id, "no"));
                    // A second answer is ignored.
                    assert!(!escalations.inject(&escalation_id, "yes"));
                    return escalation_id;
                }
                Ok(_) => continue,
                Err(e) => panic!("bus closed: {}", e),
            }
        }
    });

    let result = executor
        .execute(&research_graph(), &Goal::new("summarize"), HashMap::new(), None)
        .await;
    let escalation_id = responder.await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert!(!executor.escalations().contains(&escalation_id));
    let answer = llm.requests()[2].messages.last().unwrap().clone();
    assert!(matches!(
        &answer.content[0],
        ContentBlock::ToolResult { content, is_error: false, .. } if content == "no"
    ));
}

#[tokio::test]
async fn success_criteria_are_checked_by_the_model() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        tool_call_response(&[("set_output", json!({"key": "title", "value": "Hi"}))]),
        text_response(r#"{"verdict": "retry", "reason": "too short", "hint": "use at least five words"}"#),
        tool_call_response(&[("set_output", json!({"key": "title", "value": "A Gentle Tour of Rust"}))]),
        text_response(r#"{"verdict": "accept"}"#),
    ]));
    let graph = GraphSpec::new("g", "title").with_node(
        NodeSpec::new("title", "Title", NodeKind::EventLoop)
            .with_outputs(["title"])
            .with_success_criteria("The title has at least five words"),
    );

    let result = GraphExecutor::new(Some(llm.clone() as Arc<dyn LlmClient>), ModelConfig::default())
        .execute(&graph, &Goal::new("name the post"), HashMap::new(), None)
        .await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.output["title"], json!("A Gentle Tour of Rust"));
    assert_eq!(llm.call_count(), 4);
    let feedback = llm.requests()[2].messages.last().unwrap().text();
    assert!(feedback.contains("use at least five words"), "{}", feedback);
}
