use std::time::Duration;

use crate::http::HttpStatus;
use crate::message::CorrelationId;

/// Category of a broker transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Broker cannot be reached at all. Transient.
    Unreachable,
    /// Connection or channel dropped mid-operation. Transient.
    Connectivity,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportErrorKind::Unreachable => f.write_str("unreachable"),
            TransportErrorKind::Connectivity => f.write_str("connectivity"),
        }
    }
}

/// Unified error type of the bus.
///
/// Every variant is kept intact as it travels through retries and handlers,
/// so callers can match on the kind they care about.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("transport ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("http {status}: {message}")]
    Http { status: HttpStatus, message: String },

    #[error("'{wire_type}' ({correlation_id}) timed out after {ttl:?}")]
    TimedOut {
        wire_type: String,
        correlation_id: CorrelationId,
        ttl: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("no subscription found for '{wire_type}'")]
    NoSubscriptionFound { wire_type: String },

    #[error("event handler not found for: {}", .wire_types.join(", "))]
    EventHandlerNotFound { wire_types: Vec<String> },

    #[error("deserialization: {0}")]
    Deserialization(String),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("application: {0}")]
    Application(String),

    #[error("configuration: {0}")]
    Configuration(String),
}

impl BusError {
    /// Broker is offline or refuses connections.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Unreachable,
            message: msg.into(),
        }
    }

    /// Connection or channel lost while an operation was in flight.
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::Connectivity,
            message: msg.into(),
        }
    }

    /// Handler-level failure, never retried.
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Failure reported by an HTTP-carried operation.
    pub fn http(status: HttpStatus, msg: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: msg.into(),
        }
    }

    /// Reference transient classification.
    ///
    /// Connectivity and unreachable transport failures, reply timeouts and
    /// 5xx HTTP statuses are safe to retry. Everything else, including
    /// caller cancellation and 4xx statuses, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Transport { .. } => true,
            BusError::TimedOut { .. } => true,
            BusError::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }

    /// Add context to the error message, preserving the variant.
    ///
    /// Structured variants (timeouts, routing failures, cancellation) are
    /// returned unchanged.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            BusError::Transport { kind, message } => BusError::Transport {
                kind,
                message: format!("{ctx}: {message}"),
            },
            BusError::Http { status, message } => BusError::Http {
                status,
                message: format!("{ctx}: {message}"),
            },
            BusError::Deserialization(msg) => BusError::Deserialization(format!("{ctx}: {msg}")),
            BusError::Serialization(msg) => BusError::Serialization(format!("{ctx}: {msg}")),
            BusError::Application(msg) => BusError::Application(format!("{ctx}: {msg}")),
            BusError::Configuration(msg) => BusError::Configuration(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
