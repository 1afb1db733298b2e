use serde::{Deserialize, Serialize};

/// The goal a graph run works towards.
///
/// Nodes receive the goal as prompt context; edge conditions and routers may
/// consult it when deciding where to go next.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Goal {
    /// Short identifier, used in logs.
    #[serde(default)]
    pub id: String,
    /// Human-readable description of what the run should achieve.
    pub description: String,
    /// Free-text success criteria.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Free-text constraints (time, cost, safety, scope).
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Goal {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            description: description.into(),
            success_criteria: vec![],
            constraints: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_criterion(mut self, criterion: impl Into<String>) -> Self {
        self.success_criteria.push(criterion.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Render the goal as a prompt section.
    pub fn to_prompt_context(&self) -> String {
        let mut out = format!("## Goal\n\n{}\n", self.description);
        if !self.success_criteria.is_empty() {
            out.push_str("\n### Success criteria\n");
            for c in &self.success_criteria {
                out.push_str(&format!("- {}\n", c));
            }
        }
        if !self.constraints.is_empty() {
            out.push_str("\n### Constraints\n");
            for c in &self.constraints {
                out.push_str(&format!("- {}\n", c));
            }
        }
        out
    }
}
