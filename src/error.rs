use thiserror::Error;

/// Failures raised by the activity store.
///
/// `IdentityMismatch` and `MalformedRecord` are consistency errors: the store
/// refuses to serve the document rather than guess, and neither is retryable.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state document belongs to check '{found}', not '{expected}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("entry '{key}' is not an activity record: {reason}")]
    MalformedRecord { key: String, reason: String },

    #[error("state document i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("state document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
