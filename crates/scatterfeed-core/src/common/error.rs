//! Error types for the chunk protocol.
//!
//! This module defines the central `Error` enum shared by the worker and
//! leader roles. It implements `From<Error>` for `tonic::Status` so handlers
//! can propagate failures to gRPC clients with `?`.
//!
//! ## Error Cases
//! - `NotFound`: The request or session id is unknown, drained, cancelled or
//!   expired. The caller has to restart its query.
//! - `Unavailable`: A backend worker could not be reached while fanning out
//!   the first request.
//! - `Internal`: A backend worker answered the first request with an error.
//! - `InvalidRequest`: The client request was malformed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use core::fmt;
use tonic::{Code, Status};

pub type Result<T> = core::result::Result<T, Error>;

/// Why a request id no longer resolves to live state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The id was never issued by this process, or its tombstone was swept.
    Unknown,
    /// Every record was delivered.
    Exhausted,
    /// The caller cancelled the request.
    Cancelled,
    /// The reaper evicted the request after it sat idle.
    Expired,
    /// A backend worker no longer knew its session, so the remaining records
    /// can not be delivered.
    WorkerLost,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown",
            Self::Exhausted => "already drained",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::WorkerLost => "a worker lost its session",
        };
        f.write_str(text)
    }
}

/// Unified error type for the chunk protocol.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// No live state exists for the id.
    #[error("Request {request_id} not found ({reason})")]
    NotFound {
        request_id: String,
        reason: CloseReason,
    },

    /// A backend worker could not be reached.
    #[error("Worker {worker} unavailable: {reason}")]
    Unavailable { worker: String, reason: String },

    /// A backend worker or local invariant failed.
    #[error("Internal error: {context}")]
    Internal { context: String },

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn not_found(request_id: impl Into<String>, reason: CloseReason) -> Self {
        Self::NotFound {
            request_id: request_id.into(),
            reason,
        }
    }

    /// Classifies a failed call to a backend worker during the first fan-out.
    ///
    /// Transport-level failures become [`Error::Unavailable`] and a rejected
    /// query stays [`Error::InvalidRequest`], so a leader answers bad input
    /// exactly like a worker. Everything else becomes [`Error::Internal`].
    pub fn from_worker_status(worker: &str, status: &Status) -> Self {
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => Self::Unavailable {
                worker: worker.to_string(),
                reason: status.message().to_string(),
            },
            Code::InvalidArgument => Self::InvalidRequest {
                reason: status.message().to_string(),
            },
            code => Self::Internal {
                context: format!("worker {worker} failed with {code:?}: {}", status.message()),
            },
        }
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { request_id, reason } => {
                Status::not_found(format!("Request {request_id} not found ({reason})"))
            }
            Error::Unavailable { worker, reason } => {
                Status::unavailable(format!("Worker {worker} unavailable: {reason}"))
            }
            Error::Internal { context } => Status::internal(context),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
