use thiserror::Error;

#[derive(Debug, Error)]
pub enum CascadeError {
    // Workflow errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Admission limit reached: {running} running, {queued} queued")]
    AdmissionLimit { running: usize, queued: usize },

    // Role errors
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Role execution failed: {role}: {message}")]
    RoleExecution { role: String, message: String },

    #[error("Role timeout after {timeout_secs}s: {role}")]
    RoleTimeout { role: String, timeout_secs: u64 },

    // Context errors
    #[error("Context is compressed and read-only: {0}")]
    ContextSealed(String),

    // Recovery errors
    #[error("Error classifier failed: {classifier}: {message}")]
    Classifier { classifier: String, message: String },

    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CascadeError>;
