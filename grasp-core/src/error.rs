//! Error types and status codes for GRASP operations.

use thiserror::Error;

/// GRASP protocol errors.
///
/// Every public operation returns `GraspResult`; nothing in the engine
/// panics on bad input. `Timeout`, `NoReply` and `Declined` are normal
/// protocol outcomes rather than failures of the engine itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraspError {
    /// Malformed input value (bad flags combination, empty name, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown nonce, objective, session or listener.
    #[error("not found: {0}")]
    NotFound(String),

    /// Overlapping non-shareable registration or duplicate name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A blocking call exceeded its deadline. Not a failure of the
    /// engine; exponential backoff recommended before retry.
    #[error("timed out waiting for peer")]
    Timeout,

    /// Non-blocking variant has no result yet.
    #[error("no reply yet")]
    NoReply,

    /// Operation illegal for the current session state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Nonce space, registry capacity or loop count exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The peer declined the request, with an optional reason string.
    #[error("declined by peer: {reason}")]
    Declined { reason: String },

    /// The transport failed to accept a datagram.
    #[error("transport error: {0}")]
    Transport(String),

    /// CBOR encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),
}

impl GraspError {
    /// Numeric status code for embedders that want the C-style contract:
    /// `0` is success (never produced by an error), `declined` is 1 and
    /// `noReply` is 2, as in the GRASP API draft.
    pub fn code(&self) -> u32 {
        match self {
            Self::Declined { .. } => 1,
            Self::NoReply => 2,
            Self::InvalidArgument(_) => 3,
            Self::NotFound(_) => 4,
            Self::Conflict(_) => 5,
            Self::Timeout => 6,
            Self::InvalidState(_) => 7,
            Self::ResourceExhausted(_) => 8,
            Self::Transport(_) => 9,
            Self::Codec(_) => 10,
        }
    }

    /// Whether this outcome is an expected protocol event rather than
    /// a caller or engine mistake.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Timeout | Self::NoReply | Self::Declined { .. })
    }
}

/// Result type alias for GRASP operations.
pub type GraspResult<T> = Result<T, GraspError>;

/// Convenience constructor for peer refusals.
pub fn declined(reason: impl Into<String>) -> GraspError {
    GraspError::Declined {
        reason: reason.into(),
    }
}
