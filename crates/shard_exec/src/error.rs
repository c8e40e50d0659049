//! Error kinds surfaced by the execution engine.
//!
//! The engine distinguishes protocol misuse (`IllegalState`) from malformed
//! caller input (`InvalidArgument`), missing registry entries (`NotFound`),
//! operations invoked on a mode that does not support them (`Unimplemented`),
//! and failures propagated from the transport layer. Errors are `Clone` so a
//! failed execution status can be stored on the logical operation and
//! re-returned by every subsequent call.

use thiserror::Error;

/// Error type for all engine operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    /// Protocol misuse, e.g. fetching before executing or reusing a consumed
    /// response.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Malformed partition key, bounds, or parameters.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A physical operation is missing from a stream registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation invoked in a mode that does not support it, e.g. fetching
    /// through a cached result stream.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Failure reported by the transport while executing a batch of physical
    /// operations. Terminal for the whole logical operation.
    #[error("transport: {0}")]
    Transport(String),
}

impl ExecError {
    /// Builds an [`ExecError::IllegalState`].
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Builds an [`ExecError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Builds an [`ExecError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Builds an [`ExecError::Unimplemented`].
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented(message.into())
    }

    /// Builds an [`ExecError::Transport`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Result alias used throughout the crate.
pub type ExecResult<T> = std::result::Result<T, ExecError>;
