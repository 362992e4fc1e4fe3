use std::time::Duration;

use thiserror::Error;

/// Errors from store and distributed lock operations.
///
/// Every backend-native failure is translated into one of these categories
/// before it leaves an adapter; callers branch on [`StoreError::code`] and
/// use the Display text for diagnostics only.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient network or node failure. Retryable. Also covers redirect
    /// loops and unreachable redirect targets on clustered backends.
    #[error("connection error: {0}")]
    Connection(String),

    /// Credential failure. Not retryable without reconfiguration.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed key/value or a backend-reported logic error. Not retryable.
    #[error("data error: {0}")]
    Data(String),

    /// The requested key does not exist (or its TTL has elapsed).
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// No store is registered under the given name or id.
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// `create_or_get_store` found an existing store with different type hints.
    #[error("store {name} already exists with key type {existing_key} and value type {existing_value}")]
    StoreTypeConflict {
        name: String,
        existing_key: String,
        existing_value: String,
    },

    /// Fatal at startup: no valid backend selected or malformed configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A lock was not obtained within the caller's wait budget.
    #[error("lock acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),

    /// The caller attempted to release or extend a lock it does not hold.
    #[error("lock not held: {0}")]
    LockNotHeld(String),
}

impl StoreError {
    /// Stable numeric code for this error category.
    ///
    /// Store-level categories are in the 100 range, lock-level ones in the
    /// 500 range.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::Connection(_) => 101,
            Self::Auth(_) => 102,
            Self::Data(_) => 103,
            Self::KeyNotFound(_) => 104,
            Self::StoreNotFound(_) => 105,
            Self::StoreTypeConflict { .. } => 106,
            Self::Configuration(_) => 107,
            Self::AcquisitionTimeout(_) => 501,
            Self::LockNotHeld(_) => 502,
        }
    }

    /// Whether a caller may reasonably retry the failed operation as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// The normalized `(code, text)` pair reported to applications.
    #[must_use]
    pub fn as_pair(&self) -> (u32, String) {
        (self.code(), self.to_string())
    }
}
