//! Error types for the turngate control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the resource they concern so that log lines and status
//! messages can point at the offending object.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for turngate operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object failed validation and was not admitted
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Resource that failed validation
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Optimistic concurrency failure: the write was based on a stale version
    #[error("write conflict on {resource}: {message}")]
    Conflict {
        /// Resource whose write was rejected
        resource: String,
        /// Description from the API server
        message: String,
    },

    /// A resource the operation depends on does not exist
    #[error("{resource} not found")]
    NotFound {
        /// Resource that could not be found
        resource: String,
    },

    /// A pipeline stage went away while another was still sending to it
    #[error("channel closed: {channel}")]
    ChannelClosed {
        /// Name of the channel whose receiver was dropped
        channel: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "renderer", "operator", "updater")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named resource
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a channel-closed error
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Classify a kube error for a specific resource
    ///
    /// HTTP 409 becomes [`Error::Conflict`] and 404 becomes [`Error::NotFound`]
    /// so callers can handle optimistic concurrency and deletion races without
    /// matching on API responses themselves.
    pub fn from_kube(resource: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                resource: resource.into(),
            },
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need the input fixed.
    /// Conflicts are retried after re-reading the current version.
    /// Kubernetes errors are retried unless the API server rejected the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => false,
            Error::ChannelClosed { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Whether this error means the target resource is gone
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Conflict { resource, .. } => Some(resource),
            Error::NotFound { resource } => Some(resource),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
