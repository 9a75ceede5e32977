use std::sync::Arc;

use thiserror::Error;

/// Outcome delivered to every caller sharing one coalesced operation.
#[derive(Debug, Error)]
pub enum EnsureError<E> {
    /// The wrapped operation failed. Every waiter receives the same `Arc`.
    #[error("{0}")]
    Operation(Arc<E>),
    /// The operation never settled: it panicked or its task was torn down.
    #[error("ensure for {key} aborted: {reason}")]
    Aborted { key: String, reason: String },
}

impl<E> EnsureError<E> {
    pub fn operation_error(&self) -> Option<&Arc<E>> {
        match self {
            EnsureError::Operation(err) => Some(err),
            EnsureError::Aborted { .. } => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, EnsureError::Aborted { .. })
    }
}

// Manual impl: sharing the error must not require `E: Clone`.
impl<E> Clone for EnsureError<E> {
    fn clone(&self) -> Self {
        match self {
            EnsureError::Operation(err) => EnsureError::Operation(Arc::clone(err)),
            EnsureError::Aborted { key, reason } => EnsureError::Aborted {
                key: key.clone(),
                reason: reason.clone(),
            },
        }
    }
}

pub type EnsureResult<T, E> = Result<T, EnsureError<E>>;
