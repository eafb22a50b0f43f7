use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response returned by the HTTP layer.
/// Never carries raw internal error text: only a code, a safe message and
/// enough context for a client to correct its request.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "validation_failed", "not_found")
    pub error: String,
    /// Human-readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error codes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const RATE_LIMITED: &str = "rate_limited";
}

/// Failure of the opaque language-model capability.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("language model request failed: {0}")]
    Transport(String),
    #[error("language model returned HTTP {status}")]
    Status { status: u16 },
    #[error("language model call timed out after {0}s")]
    Timeout(u64),
    #[error("language model returned empty content")]
    EmptyReply,
    #[error("language model is not configured: {0}")]
    NotConfigured(String),
}

/// Structural planner failure: the reply could not be turned into a plan.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("planner reply was not valid JSON: {0}")]
    InvalidJson(String),
    #[error("planner reply did not match the response plan schema: {0}")]
    Schema(String),
}

impl PlanError {
    /// Short class name for logs and `fallback_reason`.
    pub fn class(&self) -> &'static str {
        match self {
            PlanError::Llm(LlmError::Timeout(_)) => "planner_timeout",
            PlanError::Llm(_) => "planner_unavailable",
            PlanError::InvalidJson(_) => "planner_invalid_json",
            PlanError::Schema(_) => "planner_schema_mismatch",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("classifier reply was not valid JSON: {0}")]
    InvalidJson(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("failed to read resource registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("resource registry is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}
