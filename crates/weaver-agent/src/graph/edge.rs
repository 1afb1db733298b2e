use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directed, conditionally traversed link between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    #[serde(default)]
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Condition that must be true to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Higher priority edges are evaluated first; ties keep declaration order.
    #[serde(default)]
    pub priority: i32,
    /// Target key -> source key, resolved from the source output, then memory.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
}

/// Condition for traversing an edge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only if the source node succeeded.
    OnSuccess,
    /// Traverse only if the source node failed.
    OnFailure,
    /// Traverse if an expression over the source output and memory holds.
    /// See [`evaluate_condition`].
    Conditional { expr: String },
    /// Ask the LLM to decide whether to traverse.
    LlmDecide { prompt: String },
}

impl EdgeSpec {
    fn with_condition(source: impl Into<String>, target: impl Into<String>, condition: EdgeCondition) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition,
            priority: 0,
            input_mapping: BTreeMap::new(),
        }
    }

    /// Create an unconditional edge.
    pub fn always(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_condition(source, target, EdgeCondition::Always)
    }

    /// Create an edge that fires on success.
    pub fn on_success(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_condition(source, target, EdgeCondition::OnSuccess)
    }

    /// Create an edge that fires on failure.
    pub fn on_failure(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_condition(source, target, EdgeCondition::OnFailure)
    }

    /// Create a conditional edge.
    pub fn conditional(source: impl Into<String>, target: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::with_condition(source, target, EdgeCondition::Conditional { expr: expr.into() })
    }

    /// Create an edge decided by the model.
    pub fn llm_decide(source: impl Into<String>, target: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::with_condition(source, target, EdgeCondition::LlmDecide { prompt: prompt.into() })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mapping(mut self, target_key: impl Into<String>, source_key: impl Into<String>) -> Self {
        self.input_mapping.insert(target_key.into(), source_key.into());
        self
    }

    /// Resolve the input mapping against the source output and memory.
    /// Source keys found in neither are skipped.
    pub fn map_inputs(
        &self,
        output: &HashMap<String, Value>,
        memory: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        self.input_mapping
            .iter()
            .filter_map(|(target_key, source_key)| {
                output
                    .get(source_key)
                    .or_else(|| memory.get(source_key))
                    .map(|v| (target_key.clone(), v.clone()))
            })
            .collect()
    }
}

/// Data a conditional expression is evaluated against.
pub struct ConditionScope<'a> {
    pub success: bool,
    pub output: &'a HashMap<String, Value>,
    pub memory: &'a HashMap<String, Value>,
}

/// Evaluate a conditional expression.
///
/// Grammar, loosest binding first:
/// - `a or b`, `a and b`
/// - `not a`
/// - `lhs OP rhs` with OP one of `==`, `!=`, `>=`, `<=`, `>`, `<`, `contains`
/// - a bare operand, tested for truthiness
///
/// Operands: `success`, `output.key`, `memory.key`, or a bare key (output
/// first, then memory); dotted paths descend into objects. The right-hand side
/// is a JSON literal, or a string with optional quotes.
///
/// Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, scope: &ConditionScope<'_>) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return false;
    }

    if let Some(parts) = split_keyword(expr, " or ") {
        return parts.iter().any(|p| evaluate_condition(p, scope));
    }
    if let Some(parts) = split_keyword(expr, " and ") {
        return parts.iter().all(|p| evaluate_condition(p, scope));
    }
    if let Some(rest) = expr.strip_prefix("not ") {
        return !evaluate_condition(rest, scope);
    }

    match parse_operator(expr) {
        Some((lhs, op, rhs)) => {
            let Some(left) = resolve_operand(lhs, scope) else {
                return false;
            };
            compare(&left, op, &parse_literal(rhs))
        }
        None => resolve_operand(expr, scope).is_some_and(|v| is_truthy(&v)),
    }
}

/// Split `expr` on `keyword` where it sits outside quoted literals.
fn split_keyword<'a>(expr: &'a str, keyword: &str) -> Option<Vec<&'a str>> {
    let mut parts = Vec::new();
    let mut rest = expr;
    while let Some(pos) = find_unquoted(rest, keyword) {
        parts.push(&rest[..pos]);
        rest = &rest[pos + keyword.len()..];
    }
    if parts.is_empty() {
        return None;
    }
    parts.push(rest);
    Some(parts)
}

/// Byte offset of the first `pattern` outside single or double quotes.
fn find_unquoted(expr: &str, pattern: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (pos, c) in expr.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if expr[pos..].starts_with(pattern) => return Some(pos),
            None => {}
        }
    }
    None
}

const OPERATORS: [&str; 7] = [" contains ", ">=", "<=", "!=", "==", ">", "<"];

/// Find the earliest operator in `expr`, preferring the longer one on a tie.
fn parse_operator(expr: &str) -> Option<(&str, &str, &str)> {
    let (pos, op) = OPERATORS
        .iter()
        .filter_map(|op| find_unquoted(expr, op).map(|pos| (pos, *op)))
        .min_by(|a, b| a.0.cmp(&b.0).then(b.1.len().cmp(&a.1.len())))?;
    let lhs = expr[..pos].trim();
    let rhs = expr[pos + op.len()..].trim();
    if lhs.is_empty() {
        return None;
    }
    Some((lhs, op.trim(), rhs))
}

fn resolve_operand(operand: &str, scope: &ConditionScope<'_>) -> Option<Value> {
    if operand == "success" {
        return Some(Value::Bool(scope.success));
    }

    let (sources, path): (Vec<&HashMap<String, Value>>, &str) =
        if let Some(rest) = operand.strip_prefix("output.") {
            (vec![scope.output], rest)
        } else if let Some(rest) = operand.strip_prefix("memory.") {
            (vec![scope.memory], rest)
        } else {
            (vec![scope.output, scope.memory], operand)
        };

    let mut segments = path.split('.');
    let head = segments.next()?;
    let root = sources.iter().find_map(|m| m.get(head))?;
    let mut current = root;
    for seg in segments {
        current = match current {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    if let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
    {
        return Value::String(inner.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn compare(left: &Value, op: &str, right: &Value) -> bool {
    match op {
        "==" => values_equal(left, right),
        "!=" => !values_equal(left, right),
        "contains" => match (left, right) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        ">" | "<" | ">=" | "<=" => {
            let (Some(l), Some(r)) = (as_number(left), as_number(right)) else {
                return false;
            };
            match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                _ => l <= r,
            }
        }
        _ => false,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        return l == r;
    }
    match (left, right) {
        (Value::String(l), Value::String(r)) => l == r,
        // Allow `flag == "true"` and `count == "3"` style comparisons.
        (other, Value::String(r)) if !other.is_string() => other.to_string() == *r,
        _ => left == right,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
