use std::collections::HashMap;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info};

use weaver_core::error::Result;

use super::{NodeContext, NodeProtocol, NodeResult};
use crate::graph::NodeKind;
use crate::llm_call::complete_text;

/// Picks its own successor from `routes`, bypassing edge evaluation.
///
/// A single route is taken without consulting the model.
pub struct RouterNode;

impl RouterNode {
    async fn run(&self, ctx: &NodeContext) -> Result<NodeResult> {
        let start = Instant::now();
        let routes = &ctx.spec.routes;

        if routes.is_empty() {
            return Ok(NodeResult::failure(format!("Router '{}' has no routes", ctx.node_id)));
        }

        let (label, tokens) = match routes.keys().next() {
            Some(only) if routes.len() == 1 => (only.clone(), 0),
            _ => {
                let llm = ctx.llm()?;
                let (answer, tokens) = complete_text(llm.as_ref(), &ctx.model, None, self.prompt(ctx)).await?;
                match choose_label(&answer, routes.keys()) {
                    Some(label) => (label, tokens),
                    None => {
                        return Ok(NodeResult::failure(format!(
                            "Router '{}' could not match a route in response: {}",
                            ctx.node_id,
                            answer.trim()
                        ))
                        .with_tokens(tokens))
                    }
                }
            }
        };

        let target = routes[&label].clone();
        info!(node_id = %ctx.node_id, route = %label, target = %target, "Route chosen");

        let mut output = HashMap::new();
        if let Some(key) = ctx.spec.output_keys.first() {
            output.insert(key.clone(), Value::String(label));
        }
        let mut result = NodeResult::ok(output).with_next(target).with_tokens(tokens);
        result.latency_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    fn prompt(&self, ctx: &NodeContext) -> String {
        let context = ctx
            .context_data()
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");
        let labels = ctx.spec.routes.keys().cloned().collect::<Vec<_>>().join(", ");
        let instructions = ctx.spec.system_prompt.as_deref().unwrap_or("Choose the next step.");

        format!(
            "{}\n\n{}\nContext:\n{}\n\nAvailable routes: {}\nRespond with ONLY the route name.",
            instructions,
            ctx.goal.to_prompt_context(),
            context,
            labels
        )
    }
}

/// Exact (case-insensitive) match first, then the longest label mentioned.
fn choose_label<'a>(answer: &str, labels: impl Iterator<Item = &'a String> + Clone) -> Option<String> {
    let normalized = answer.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.').to_lowercase();
    if let Some(exact) = labels.clone().find(|l| l.to_lowercase() == normalized) {
        return Some(exact.clone());
    }
    debug!(answer = %normalized, "No exact route match, scanning response");
    labels
        .filter(|l| normalized.contains(&l.to_lowercase()))
        .max_by_key(|l| l.len())
        .cloned()
}

impl NodeProtocol for RouterNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Router
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(self.run(ctx))
    }
}
