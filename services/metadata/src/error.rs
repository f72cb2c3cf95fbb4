use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while handling a change notification
#[derive(Error, Debug)]
pub enum Error {
    /// The envelope is not the supported notification shape
    #[error("Unsupported source format: {0}")]
    UnsupportedSourceFormat(String),

    /// The envelope has the supported shape but required fields are missing or mistyped
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The referenced object, version or etag no longer exists
    #[error("Object unavailable: {container}/{key}")]
    ObjectUnavailable { container: String, key: String },

    /// A collaborator (object store, label detection, record store) failed
    #[error("{collaborator} request failed: {message}")]
    Transport {
        collaborator: &'static str,
        message: String,
    },

    /// A caller-supplied timeout elapsed
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A stored record could not be decoded
    #[error("Failed to decode stored record: {0}")]
    Decode(String),
}

impl Error {
    pub fn transport(collaborator: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Transport {
            collaborator,
            message: err.to_string(),
        }
    }

    /// Parse failures carry no retry value; everything else may succeed on redelivery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedSourceFormat(_) | Error::MalformedEvent(_)
        )
    }

    pub fn is_object_unavailable(&self) -> bool {
        matches!(self, Error::ObjectUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
