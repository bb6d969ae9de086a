use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed or out-of-range input.
    Validation(String),
    /// Entity kind ("activity", "court", "user", ...) and id.
    NotFound(&'static str, Ulid),
    /// Operation invalid for the current status.
    State(&'static str),
    /// Actor lacks permission.
    Authorization(&'static str),
    /// Duplicate membership, overlapping reservation, or a contended lock.
    Conflict(String),
    /// Store failure or a violated invariant.
    Internal(String),
}

impl EngineError {
    /// Only conflicts and internal failures can succeed on an unchanged retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::Internal(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(..) => "not_found",
            EngineError::State(_) => "state",
            EngineError::Authorization(_) => "authorization",
            EngineError::Conflict(_) => "conflict",
            EngineError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            EngineError::State(msg) => write!(f, "invalid state: {msg}"),
            EngineError::Authorization(msg) => write!(f, "not authorized: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
