//! Internal error types.
//!
//! Nothing here travels on the wire directly: every error maps onto a
//! closed [`Outcome`] and is reported to the client as a `{ctrl}` envelope.

use thiserror::Error;

use crate::outcome::Outcome;

/// Envelope decoding / encoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Zero or several variants, a missing required field, or invalid JSON.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("encode error: {0}")]
    Encode(String),

    /// Client protocol version older than the configured minimum.
    #[error("protocol version '{0}' not supported")]
    UnsupportedVersion(String),
}

impl ProtocolError {
    /// Outcome reported to the client for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Malformed(_) => Outcome::Malformed,
            Self::Encode(_) => Outcome::InternalError,
            Self::UnsupportedVersion(_) => Outcome::VersionNotSupported,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Fan-out hub failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("topic {0} is full")]
    TopicFull(String),

    /// Outbound channel of the session is gone (session terminated).
    #[error("session {0} channel closed")]
    ChannelClosed(String),
}

impl HubError {
    /// Outcome reported to the client for this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::UnknownSession(_) => Outcome::UserNotFound,
            Self::TopicFull(_) => Outcome::PolicyViolation,
            Self::ChannelClosed(_) => Outcome::Gone,
        }
    }
}
