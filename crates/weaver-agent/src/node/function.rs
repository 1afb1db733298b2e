use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::warn;

use weaver_core::error::Result;

use super::{NodeContext, NodeProtocol, NodeResult};
use crate::graph::NodeKind;

/// Code run by a function node. Receives the node's declared inputs and
/// returns its outputs.
pub trait NodeFunction: Send + Sync {
    fn call(&self, inputs: HashMap<String, Value>) -> BoxFuture<'_, Result<HashMap<String, Value>>>;
}

struct SyncFunction<F>(F);

impl<F> NodeFunction for SyncFunction<F>
where
    F: Fn(HashMap<String, Value>) -> Result<HashMap<String, Value>> + Send + Sync,
{
    fn call(&self, inputs: HashMap<String, Value>) -> BoxFuture<'_, Result<HashMap<String, Value>>> {
        let result = (self.0)(inputs);
        Box::pin(async move { result })
    }
}

/// Functions keyed by the id of the node that runs them.
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn NodeFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, node_id: impl Into<String>, func: Arc<dyn NodeFunction>) {
        self.functions.insert(node_id.into(), func);
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, node_id: impl Into<String>, func: F)
    where
        F: Fn(HashMap<String, Value>) -> Result<HashMap<String, Value>> + Send + Sync + 'static,
    {
        self.register(node_id, Arc::new(SyncFunction(func)));
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<dyn NodeFunction>> {
        self.functions.get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.functions.contains_key(node_id)
    }
}

pub struct FunctionNode {
    func: Arc<dyn NodeFunction>,
}

impl FunctionNode {
    pub fn new(func: Arc<dyn NodeFunction>) -> Self {
        Self { func }
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeResult> {
        let start = Instant::now();
        let inputs: HashMap<String, Value> = ctx
            .spec
            .input_keys
            .iter()
            .filter_map(|k| ctx.lookup(k).map(|v| (k.clone(), v)))
            .collect();

        let mut result = match self.func.call(inputs).await {
            Ok(output) => NodeResult::ok(output),
            Err(e) => {
                warn!(node_id = %ctx.node_id, error = %e, "Function node failed");
                NodeResult::failure(e.to_string())
            }
        };
        result.latency_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }
}

impl NodeProtocol for FunctionNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Function
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(self.run(ctx))
    }
}
