use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use weaver_core::error::WeaverError;

/// The closed set of node kinds the executor knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    LlmToolUse,
    LlmGenerate,
    Router,
    Function,
    EventLoop,
    HumanInput,
}

impl NodeKind {
    pub const ALL: [NodeKind; 6] = [
        NodeKind::LlmToolUse,
        NodeKind::LlmGenerate,
        NodeKind::Router,
        NodeKind::Function,
        NodeKind::EventLoop,
        NodeKind::HumanInput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmToolUse => "llm_tool_use",
            Self::LlmGenerate => "llm_generate",
            Self::Router => "router",
            Self::Function => "function",
            Self::EventLoop => "event_loop",
            Self::HumanInput => "human_input",
        }
    }

    fn valid_kinds() -> String {
        Self::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = WeaverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| WeaverError::UnknownNodeKind {
                kind: s.to_string(),
                valid: Self::valid_kinds(),
            })
    }
}

/// A node in the execution graph.
///
/// Immutable once loaded. `kind` is kept as authored and resolved to a
/// [`NodeKind`] when the executor needs it, so an unknown kind surfaces as a
/// configuration error rather than a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Node kind, one of [`NodeKind::ALL`].
    pub kind: String,
    /// Memory keys this node reads.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Memory keys this node writes.
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Tool names available to this node.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Attempts allowed before the run fails on this node.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Event-loop nodes this node may delegate to.
    #[serde(default)]
    pub sub_agents: Vec<String>,
    /// Free-text completion hint for agentic loops.
    #[serde(default)]
    pub success_criteria: Option<String>,
    /// System prompt for model-backed nodes.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Router choices: label -> target node id.
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    /// Maximum model turns for LLM nodes.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_turns() -> usize {
    10
}

impl NodeSpec {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            kind: kind.as_str().to_string(),
            input_keys: vec![],
            output_keys: vec![],
            tools: vec![],
            max_retries: default_max_retries(),
            sub_agents: vec![],
            success_criteria: None,
            system_prompt: None,
            routes: BTreeMap::new(),
            max_turns: default_max_turns(),
        }
    }

    pub fn node_kind(&self) -> Result<NodeKind, WeaverError> {
        self.kind.parse()
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sub_agents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_agents = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_route(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.insert(label.into(), target.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_success_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.success_criteria = Some(criteria.into());
        self
    }

    pub fn with_max_turns(mut self, turns: usize) -> Self {
        self.max_turns = turns;
        self
    }

    /// Build the prompt for this node by injecting context data.
    pub fn build_prompt(&self, base_prompt: &str, context_data: &HashMap<String, serde_json::Value>) -> String {
        let mut prompt = String::new();

        if !self.input_keys.is_empty() {
            prompt.push_str("## Context Data\n\n");
            for key in &self.input_keys {
                if let Some(value) = context_data.get(key) {
                    let display = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    prompt.push_str(&format!("**{}**: {}\n", key, display));
                }
            }
            prompt.push_str("\n---\n\n");
        }

        prompt.push_str(base_prompt);
        prompt
    }
}
