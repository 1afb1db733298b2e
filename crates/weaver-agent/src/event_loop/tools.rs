//! Definitions of the tools the loop injects next to a node's own tools.

use serde_json::json;

use weaver_core::types::ToolDefinition;

pub const SET_OUTPUT: &str = "set_output";
pub const DELEGATE: &str = "delegate_to_sub_agent";
pub const REPORT_TO_PARENT: &str = "report_to_parent";

pub fn set_output(output_keys: &[String]) -> ToolDefinition {
    ToolDefinition {
        name: SET_OUTPUT.to_string(),
        description: format!(
            "Record the value of one of your declared outputs ({}). Call once per key.",
            output_keys.join(", ")
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "enum": output_keys },
                "value": { "description": "The output value; any JSON type." }
            },
            "required": ["key", "value"]
        }),
    }
}

pub fn delegate(agent_ids: &[String]) -> ToolDefinition {
    ToolDefinition {
        name: DELEGATE.to_string(),
        description: format!(
            "Hand a self-contained task to a sub-agent and wait for its result. Available agents: {}.",
            agent_ids.join(", ")
        ),
        input_schema: json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "enum": agent_ids },
                "task": { "type": "string", "description": "What the sub-agent should do." }
            },
            "required": ["agent_id", "task"]
        }),
    }
}

pub fn report_to_parent() -> ToolDefinition {
    ToolDefinition {
        name: REPORT_TO_PARENT.to_string(),
        description: "Send a progress report to the agent that delegated this task. \
                      Set mark_complete to finish now; set wait_for_response to block until \
                      a human or the parent answers."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "data": { "description": "Optional structured payload." },
                "mark_complete": { "type": "boolean", "default": false },
                "wait_for_response": { "type": "boolean", "default": false }
            },
            "required": ["message"]
        }),
    }
}
