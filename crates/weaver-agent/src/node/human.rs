use std::collections::HashMap;

use futures::future::BoxFuture;
use tracing::info;

use weaver_core::error::Result;
use weaver_core::types::AgentEvent;

use super::{NodeContext, NodeProtocol, NodeResult};
use crate::graph::NodeKind;

/// Collects a human's answers for its output keys.
///
/// Answers come from the caller's input data, falling back to memory. Keys
/// nobody has answered yet are left out and the prompt is sent to the client,
/// so the node is normally declared as a pause node.
pub struct HumanInputNode;

impl HumanInputNode {
    async fn run(&self, ctx: &NodeContext) -> Result<NodeResult> {
        let mut output = HashMap::new();
        let mut missing = Vec::new();

        for key in &ctx.spec.output_keys {
            match ctx.input_data.get(key).cloned().or_else(|| ctx.memory.read(key)) {
                Some(value) => {
                    output.insert(key.clone(), value);
                }
                None => missing.push(key.as_str()),
            }
        }

        if !missing.is_empty() {
            let prompt = ctx
                .spec
                .system_prompt
                .clone()
                .unwrap_or_else(|| format!("Please provide: {}", missing.join(", ")));
            info!(node_id = %ctx.node_id, missing = ?missing, "Awaiting human input");
            ctx.publish(AgentEvent::ClientOutputDelta {
                node_id: ctx.node_id.clone(),
                content: prompt,
            });
        }

        Ok(NodeResult::ok(output))
    }
}

impl NodeProtocol for HumanInputNode {
    fn kind(&self) -> NodeKind {
        NodeKind::HumanInput
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(self.run(ctx))
    }
}
