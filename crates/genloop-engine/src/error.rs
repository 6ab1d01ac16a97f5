//! Engine error types.
//!
//! All engine subsystems surface errors through [`EngineError`].  Each variant
//! carries enough context for the orchestrator to decide whether to retry,
//! penalise a credential, fall back to another endpoint, or give up and
//! answer with an apology.

/// Unified error type for the request-execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Backend errors ------------------------------------------------------
    /// The backend throttled the request or reported itself busy (429/503).
    #[error("backend rate limited ({status}): {reason}")]
    RateLimited { status: u16, reason: String },

    /// The backend rejected the credential (401/403 or an invalid-key marker).
    #[error("credential rejected ({status}): {reason}")]
    InvalidCredential { status: u16, reason: String },

    /// The backend returned a non-success status that is neither throttling
    /// nor an authentication failure.
    #[error("backend returned {status}: {reason}")]
    Backend { status: u16, reason: String },

    /// The HTTP request could not be sent or the body could not be read.
    #[error("backend request failed: {reason}")]
    Request { reason: String },

    /// The backend response could not be parsed into the expected format.
    #[error("backend response parse error: {reason}")]
    Parse { reason: String },

    // -- Pool errors ---------------------------------------------------------
    /// No credential became available before the acquisition ceiling.
    #[error("credential pool exhausted after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool was built without a single credential.
    #[error("credential pool has no credentials configured")]
    NoCredentials,

    // -- Tool errors ---------------------------------------------------------
    /// A tool call referenced a name that is not registered.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// A tool invocation failed inside its implementation.
    #[error("tool `{tool_name}` failed: {reason}")]
    ToolFailed { tool_name: String, reason: String },

    /// The arguments supplied by the model do not match the tool's schema.
    #[error("invalid arguments for tool `{tool_name}`: {reason}")]
    InvalidToolArguments { tool_name: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Collaborators -------------------------------------------------------
    /// Loading or saving conversation history failed.  The error
    /// [`History`](crate::History) implementations return.
    #[error("history error: {reason}")]
    History { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether the failure is transient and worth retrying on the same
    /// credential before penalising it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether the failure proves the credential itself is unusable.
    pub fn is_credential_invalid(&self) -> bool {
        matches!(self, Self::InvalidCredential { .. })
    }

    /// Build the error matching an HTTP status returned by a backend.
    ///
    /// 429 and 503 are throttling; 401, 403, and 400 carrying an invalid-key
    /// marker are credential failures; everything else is a plain backend
    /// failure.
    pub fn from_status(status: u16, body: &str) -> Self {
        let reason = truncate(body, 512);
        match status {
            429 | 503 => Self::RateLimited { status, reason },
            401 | 403 => Self::InvalidCredential { status, reason },
            400 if mentions_invalid_key(body) => Self::InvalidCredential { status, reason },
            _ => Self::Backend { status, reason },
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request {
            reason: err.to_string(),
        }
    }
}

fn mentions_invalid_key(body: &str) -> bool {
    let upper = body.to_uppercase();
    upper.contains("API_KEY_INVALID")
        || upper.contains("INVALID_API_KEY")
        || upper.contains("INVALID API KEY")
        || upper.contains("INVALID CREDENTIAL")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}
