/// Record-store error with retry classification.
///
/// Backends return this error type to indicate whether an operation is worth
/// retrying. The agent loop and the host sweeps use `is_retryable()` to decide
/// whether to log-and-revisit or to alert.
///
/// **Retryable**: database busy/locked, connection timeouts, transient I/O.
///
/// **Permanent**: malformed record bodies, unknown record kinds, invalid filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Operation that failed (e.g. "store", "query")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    /// Whether this error should be retried
    pub retryable: bool,
}

impl StoreError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Body (de)serialization failures are never transient.
    pub fn codec(operation: impl Into<String>, err: serde_json::Error) -> Self {
        Self::permanent(operation, format!("record codec: {err}"))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for StoreError {}
