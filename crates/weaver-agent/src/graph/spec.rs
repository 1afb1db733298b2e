use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use weaver_core::error::{Result, WeaverError};

use super::edge::EdgeSpec;
use super::node::NodeSpec;
use super::result::SessionState;

/// An immutable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub id: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Node the run starts at when not resuming.
    pub entry_node: String,
    /// Named entry points (trigger id -> node id), used when resuming.
    #[serde(default)]
    pub entry_points: HashMap<String, String>,
    /// Nodes after which the run suspends with a resumable snapshot.
    #[serde(default)]
    pub pause_nodes: BTreeSet<String>,
    /// Nodes after which the run ends successfully.
    #[serde(default)]
    pub terminal_nodes: BTreeSet<String>,
    /// Step budget for one run. Retries do not consume it.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_max_steps() -> usize {
    100
}

impl GraphSpec {
    pub fn new(id: impl Into<String>, entry_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: vec![],
            edges: vec![],
            entry_node: entry_node.into(),
            entry_points: HashMap::new(),
            pause_nodes: BTreeSet::new(),
            terminal_nodes: BTreeSet::new(),
            max_steps: default_max_steps(),
        }
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_entry_point(mut self, trigger: impl Into<String>, node_id: impl Into<String>) -> Self {
        self.entry_points.insert(trigger.into(), node_id.into());
        self
    }

    pub fn with_pause_node(mut self, node_id: impl Into<String>) -> Self {
        self.pause_nodes.insert(node_id.into());
        self
    }

    pub fn with_terminal_node(mut self, node_id: impl Into<String>) -> Self {
        self.terminal_nodes.insert(node_id.into());
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Load a graph from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaverError::ConfigNotFound(path.display().to_string()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content).map_err(|e| WeaverError::Config(e.to_string())),
            _ => Ok(serde_json::from_str(&content)?),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node id -> spec, used as the sub-agent registry.
    pub fn node_map(&self) -> HashMap<String, NodeSpec> {
        self.nodes.iter().map(|n| (n.id.clone(), n.clone())).collect()
    }

    /// Edges leaving `node_id`, highest priority first; ties keep declaration order.
    pub fn outgoing_edges(&self, node_id: &str) -> Vec<&EdgeSpec> {
        let mut edges: Vec<&EdgeSpec> = self.edges.iter().filter(|e| e.source == node_id).collect();
        edges.sort_by(|a, b| b.priority.cmp(&a.priority));
        edges
    }

    /// Structural checks. An empty list means the graph is well formed.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();

        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                errors.push(format!("Duplicate node id '{}'", node.id));
            }
        }

        if !ids.contains(self.entry_node.as_str()) {
            errors.push(format!("Entry node '{}' not found", self.entry_node));
        }

        for edge in &self.edges {
            if !ids.contains(edge.source.as_str()) {
                errors.push(format!("Edge '{}' has unknown source '{}'", edge.id, edge.source));
            }
            if !ids.contains(edge.target.as_str()) {
                errors.push(format!("Edge '{}' has unknown target '{}'", edge.id, edge.target));
            }
        }

        for id in &self.pause_nodes {
            if !ids.contains(id.as_str()) {
                errors.push(format!("Pause node '{}' not found", id));
            }
        }
        for id in &self.terminal_nodes {
            if !ids.contains(id.as_str()) {
                errors.push(format!("Terminal node '{}' not found", id));
            }
        }

        let mut entry_points: Vec<_> = self.entry_points.iter().collect();
        entry_points.sort();
        for (trigger, target) in entry_points {
            if !ids.contains(target.as_str()) {
                errors.push(format!("Entry point '{}' targets unknown node '{}'", trigger, target));
            }
        }

        for node in &self.nodes {
            for (label, target) in &node.routes {
                if !ids.contains(target.as_str()) {
                    errors.push(format!(
                        "Node '{}' route '{}' targets unknown node '{}'",
                        node.id, label, target
                    ));
                }
            }
        }

        if self.max_steps == 0 {
            errors.push("max_steps must be greater than zero".to_string());
        }

        errors
    }

    /// Node a paused run continues from.
    ///
    /// `resume_from` is looked up as an entry point, then as a node id. Without
    /// it, the `<paused_at>_resume` entry point is tried before the entry node.
    pub fn resume_node(&self, state: &SessionState) -> String {
        let candidate = state
            .resume_from
            .clone()
            .or_else(|| state.paused_at.as_ref().map(|p| format!("{}_resume", p)));

        if let Some(candidate) = candidate {
            if let Some(node_id) = self.entry_points.get(&candidate) {
                return node_id.clone();
            }
            if self.node(&candidate).is_some() {
                return candidate;
            }
        }
        self.entry_node.clone()
    }
}
