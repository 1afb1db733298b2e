use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeaverError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("No LLM client configured for node '{0}'")]
    LlmUnavailable(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Graph errors
    #[error("Graph validation failed: {}", .0.join("; "))]
    GraphValidation(Vec<String>),

    #[error("Node '{0}' not found in graph")]
    NodeNotFound(String),

    #[error("Unknown node kind '{kind}' (valid kinds: {valid})")]
    UnknownNodeKind { kind: String, valid: String },

    #[error("Function node '{0}' has no registered function")]
    UnregisteredFunction(String),

    #[error("Node '{node}' is misconfigured: {message}")]
    NodeConfig { node: String, message: String },

    // Memory errors
    #[error("Node '{node}' is not permitted to write key '{key}'")]
    MemoryPermission { node: String, key: String },

    // Security and resource errors
    #[error("Security violation: {0}")]
    Security(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("Node '{node}' exceeded max execution time ({timeout_secs}s)")]
    ExecutionTimeout { node: String, timeout_secs: u64 },

    // Agent loop errors
    #[error("Event loop exceeded max iterations ({0})")]
    MaxIterationsExceeded(usize),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WeaverError>;
