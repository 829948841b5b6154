//! Rotation error types

use std::convert::Infallible;
use thiserror::Error;

/// Errors surfaced to callers of the rotation manager.
///
/// `E` is the error type of the caller-supplied operation. Acquisition on its
/// own never runs an operation, so it uses the default `Infallible`.
/// Close and cleanup failures never show up here; they are logged and dropped.
#[derive(Error, Debug)]
pub enum RotationError<E = Infallible> {
    /// The manager has started shutting down
    #[error("Client manager is closed")]
    Closed,

    /// The creation capability failed to produce a client
    #[error("Failed to create client: {0}")]
    Create(#[source] anyhow::Error),

    /// The caller's operation failed; carried through unchanged
    #[error(transparent)]
    Operation(E),
}

impl<E> RotationError<E> {
    /// Check if this is a shutdown rejection
    pub fn is_closed(&self) -> bool {
        matches!(self, RotationError::Closed)
    }

    /// Get the operation error if that is what failed
    pub fn into_operation(self) -> Option<E> {
        match self {
            RotationError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl RotationError<Infallible> {
    /// Re-type an acquisition error for a call that also runs an operation
    pub fn widen<E>(self) -> RotationError<E> {
        match self {
            RotationError::Closed => RotationError::Closed,
            RotationError::Create(err) => RotationError::Create(err),
            RotationError::Operation(never) => match never {},
        }
    }
}

/// Result type for rotation operations
pub type RotationResult<T, E = Infallible> = Result<T, RotationError<E>>;
