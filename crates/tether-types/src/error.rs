//! Error types for the Tether system.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure categories reported on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorKind {
    /// Shape validation failed before dispatch.
    MalformedMessage,
    /// The handle does not resolve to a stored object.
    InvalidObject,
    /// `New` named an unregistered mimetype.
    InvalidObjectType,
    CouldNotGetProperty,
    CouldNotSetProperty,
    CouldNotDeleteProperty,
    CouldNotInvokeProperty,
    CouldNotInvokeObject,
    CouldNotCreateObject,
    CouldNotDestroyObject,
    /// Application code inside an invoked function failed.
    ExceptionThrown,
    /// Operation attempted on a proxy after its release was committed.
    Released,
    /// A kind this build does not know, kept verbatim.
    Other(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::MalformedMessage => "malformed message",
            ErrorKind::InvalidObject => "invalid object",
            ErrorKind::InvalidObjectType => "invalid object type",
            ErrorKind::CouldNotGetProperty => "could not get property",
            ErrorKind::CouldNotSetProperty => "could not set property",
            ErrorKind::CouldNotDeleteProperty => "could not delete property",
            ErrorKind::CouldNotInvokeProperty => "could not invoke property",
            ErrorKind::CouldNotInvokeObject => "could not invoke object",
            ErrorKind::CouldNotCreateObject => "could not create object",
            ErrorKind::CouldNotDestroyObject => "could not destroy object",
            ErrorKind::ExceptionThrown => "exception thrown",
            ErrorKind::Released => "released",
            ErrorKind::Other(kind) => kind,
        }
    }
}

impl From<String> for ErrorKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "malformed message" => ErrorKind::MalformedMessage,
            "invalid object" => ErrorKind::InvalidObject,
            "invalid object type" => ErrorKind::InvalidObjectType,
            "could not get property" => ErrorKind::CouldNotGetProperty,
            "could not set property" => ErrorKind::CouldNotSetProperty,
            "could not delete property" => ErrorKind::CouldNotDeleteProperty,
            "could not invoke property" => ErrorKind::CouldNotInvokeProperty,
            "could not invoke object" => ErrorKind::CouldNotInvokeObject,
            "could not create object" => ErrorKind::CouldNotCreateObject,
            "could not destroy object" => ErrorKind::CouldNotDestroyObject,
            "exception thrown" => ErrorKind::ExceptionThrown,
            "released" => ErrorKind::Released,
            _ => ErrorKind::Other(kind),
        }
    }
}

impl From<ErrorKind> for String {
    fn from(kind: ErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of an `["error", {...}]` response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RpcError {
    #[serde(rename = "error")]
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed() -> Self {
        Self::new(ErrorKind::MalformedMessage, "Message was malformed")
    }

    pub fn invalid_object() -> Self {
        Self::new(ErrorKind::InvalidObject, "The object does not exist")
    }

    pub fn missing_property(kind: ErrorKind) -> Self {
        Self::new(kind, "Property does not exist on this object")
    }
}

/// Top-level error type for the Tether system.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TetherError {
    /// The remote peer (or local dispatch) answered with an error response.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The proxy has been released; no wire traffic was sent.
    #[error("The object has been released")]
    Released,

    /// The channel is permanently unusable.
    #[error("Channel closed")]
    ChannelClosed,

    /// The transport failed to move bytes.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A message could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame exceeded the configured size limit.
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// The peer answered with something that is not a response envelope.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TetherError {
    /// The wire error kind, when this error carries one.
    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            TetherError::Rpc(err) => Some(&err.kind),
            _ => None,
        }
    }

    /// Convert into the payload of an error response.
    pub fn into_rpc(self, fallback: ErrorKind) -> RpcError {
        match self {
            TetherError::Rpc(err) => err,
            TetherError::Released => {
                RpcError::new(ErrorKind::Released, "The object has been released")
            }
            other => RpcError::new(fallback, other.to_string()),
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Serialization(err.to_string())
    }
}

/// Alias for Tether results.
pub type TetherResult<T> = Result<T, TetherError>;
