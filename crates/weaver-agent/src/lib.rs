pub mod event_loop;
pub mod graph;
pub mod guard;
pub mod llm_call;
pub mod memory;
pub mod node;
pub mod output_validator;
pub mod run_log;

pub use event_loop::{
    DefaultJudge, EscalationReceiver, EscalationRegistry, EscalationState, EventLoopNode, Judge, LlmJudge,
    LoopOutcome, SubagentJudge, Verdict,
};
pub use graph::{
    ConditionScope, EdgeCondition, EdgeSpec, ExecutionResult, GraphExecutor, GraphSpec, NodeKind, NodeSpec,
    SessionState,
};
pub use guard::{AuditEntry, SecurityGuard, ViolationKind};
pub use memory::{ScopedMemory, SharedMemory};
pub use node::{
    FunctionRegistry, NodeContext, NodeFunction, NodeProtocol, NodeResult, ReportCallback, SubagentReport,
};
pub use output_validator::{OutputCleaner, OutputValidator, ValidationResult};
pub use run_log::{RunLogger, RunTracker, TracingRunTracker};
