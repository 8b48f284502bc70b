//! Error taxonomy shared by the bridge core and its adapters

use std::time::Duration;

/// Crate-wide result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Typed failures of a single relay/provisioning operation.
///
/// None of these is fatal to the process; each is caught at the event
/// handler boundary and logged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    /// Any remote call failure. Not retried; the next event may succeed.
    #[error("network error during {operation}: {message}")]
    Transient { operation: String, message: String },

    /// A remote call exceeded the bridge network timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Binding or remote object missing; triggers reconciliation.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Required server-side setup is missing (e.g. parent category).
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Another task created the binding first.
    #[error("binding already exists for {key}")]
    DuplicateBinding { key: String },

    /// Mapping store failure other than a duplicate key.
    #[error("mapping store error: {message}")]
    Store { message: String },
}

impl BridgeError {
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            what: what.to_string(),
        }
    }

    #[must_use]
    pub fn configuration(message: impl std::fmt::Display) -> Self {
        Self::Configuration {
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Errors raised by a mapping store backend
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint on thread id or channel id was hit.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    /// A stored row could not be decoded.
    #[error("corrupt record for {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(key) => Self::DuplicateBinding { key },
            other => Self::Store {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_key_maps_to_duplicate_binding() {
        let err: BridgeError = StoreError::DuplicateKey("thread T1".to_string()).into();
        assert!(matches!(err, BridgeError::DuplicateBinding { ref key } if key == "thread T1"));
    }

    #[test]
    fn test_backend_maps_to_store() {
        let err: BridgeError = StoreError::Backend("disk full".to_string()).into();
        assert!(matches!(err, BridgeError::Store { .. }));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_classification() {
        assert!(BridgeError::not_found("channel 1").is_not_found());
        assert!(BridgeError::transient("send", "reset").is_transient());
        let timeout = BridgeError::Timeout {
            operation: "send".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert!(!BridgeError::configuration("no category").is_transient());
    }
}
