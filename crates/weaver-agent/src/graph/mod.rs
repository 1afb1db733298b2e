//! Graph execution engine: workflow definitions and the run loop.
//!
//! A workflow is a directed graph of [`NodeSpec`]s connected by [`EdgeSpec`]s.
//! The [`GraphExecutor`] walks it from an entry node (or a resume point),
//! executing each node under the security guard, applying retry, pause and
//! terminal rules, and following the first edge whose condition holds.

pub mod edge;
pub mod executor;
pub mod node;
pub mod result;
pub mod spec;

pub use edge::{evaluate_condition, ConditionScope, EdgeCondition, EdgeSpec};
pub use executor::GraphExecutor;
pub use node::{NodeKind, NodeSpec};
pub use result::{ExecutionResult, SessionState};
pub use spec::GraphSpec;
