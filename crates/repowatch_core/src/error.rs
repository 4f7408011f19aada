//! Error types for the coordination engine.

use thiserror::Error;

/// Result type for coordination operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the coordination engine.
///
/// Illegal transitions are deliberately absent: they are reported as
/// rejected outcomes and recorded in the event log instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Entity key is not of the form `owner/name`.
    #[error("invalid entity key {key:?}: {reason}")]
    InvalidEntityKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Another caller holds a valid lease on the entity.
    #[error("operation already in progress for {entity}")]
    LockBusy {
        /// The leased entity.
        entity: String,
    },

    /// The presented lease is not the one currently recorded for the entity.
    #[error("lease for {entity} is no longer held by this caller")]
    LeaseMismatch {
        /// The entity the lease was issued for.
        entity: String,
    },

    /// Metadata key collides with a reserved name.
    #[error("metadata key {0:?} is reserved")]
    ReservedMetadataKey(String),

    /// State name not recognized.
    #[error("unknown state: {0}")]
    UnknownState(String),
}

impl CoreError {
    /// Returns true if the error means "operation already in progress".
    pub fn is_busy(&self) -> bool {
        matches!(self, CoreError::LockBusy { .. })
    }

    /// Returns true if the caller sent something malformed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidEntityKey { .. }
                | CoreError::ReservedMetadataKey(_)
                | CoreError::UnknownState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        let busy = CoreError::LockBusy {
            entity: "acme/widget".into(),
        };
        assert!(busy.is_busy());
        assert!(!busy.is_client_error());

        assert!(CoreError::UnknownState("enriching".into()).is_client_error());
        assert!(!CoreError::LeaseMismatch {
            entity: "acme/widget".into()
        }
        .is_client_error());
    }

    #[test]
    fn error_display() {
        let err = CoreError::LockBusy {
            entity: "acme/widget".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation already in progress for acme/widget"
        );
    }
}
