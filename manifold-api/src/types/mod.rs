//! Defines fundamental types used throughout the Manifold codebase.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Enumerates all the errors that can be reported by the Manifold
/// runtime. Handler authors should try to map their errors into one
/// of these values. If no current value is appropriate, a new one
/// could be added (requiring a new release of this crate) but make
/// sure the new error code is generic enough that it may be useful
/// for other handlers. For instance, don't add an error value that
/// is specific to one bus protocol. Add a more general value and use
/// the associated description string to explain the details.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// Returned whenever a device, transaction, or handler cannot be
    /// found.
    NotFound,

    /// An operation was requested on a device whose handler doesn't
    /// provide the corresponding capability.
    Unsupported(String),

    /// An invalid or malformed argument was provided.
    InvArgument(String),

    /// A name or ID is already registered.
    Conflict(String),

    /// A write was rejected because the write queue is full.
    QueueFull,

    /// A user handler returned an error. The string holds the
    /// original message, tagged with the device and operation.
    Handler(String),

    /// A user handler panicked. The panic was recovered at the
    /// dispatch layer.
    HandlerPanic(String),

    /// An operation didn't complete in a timely fashion.
    Timeout,

    /// The operation was interrupted by a shutdown signal.
    Cancelled,

    /// A bad parameter was given in a configuration or a
    /// configuration was missing a required parameter.
    Config(String),

    /// Fallback error; seeing one of these indicates a bug in the
    /// runtime.
    Internal(String),
}

impl Error {
    /// Returns the identifier used for this error on the wire.
    /// Clients match on these strings, so they are part of the
    /// protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound => "NOT_FOUND",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::InvArgument(_) | Error::Config(_) => "INVALID_ARG",
            Error::Conflict(_) => "CONFLICT",
            Error::QueueFull => "QUEUE_FULL",
            Error::Handler(_) => "HANDLER_ERROR",
            Error::HandlerPanic(_) => "HANDLER_PANIC",
            Error::Timeout => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::Internal(_) => "INTERNAL",
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::Unsupported(v) => write!(f, "unsupported: {}", &v),
            Error::InvArgument(v) => write!(f, "invalid argument: {}", &v),
            Error::Conflict(v) => write!(f, "conflict: {}", &v),
            Error::QueueFull => write!(f, "write queue is full"),
            Error::Handler(v) => write!(f, "handler error: {}", &v),
            Error::HandlerPanic(v) => write!(f, "handler panic: {}", &v),
            Error::Timeout => write!(f, "timeout"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::Config(v) => write!(f, "config error: {}", &v),
            Error::Internal(v) => write!(f, "internal error: {}", &v),
        }
    }
}

// Defining these trait implementations allows any code that sends
// requests over an `mpsc` channel and expects the reply in a
// `oneshot` to easily translate the channel errors into a Manifold
// error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::Internal(String::from("request channel is closed"))
    }
}

impl<T> From<mpsc::error::TrySendError<T>> for Error {
    fn from(error: mpsc::error::TrySendError<T>) -> Self {
        match error {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                Error::Internal(String::from("request channel is closed"))
            }
        }
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::Internal(String::from("request dropped"))
    }
}

pub mod device;
pub mod output;
pub mod transaction;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NotFound.kind(), "NOT_FOUND");
        assert_eq!(Error::Unsupported("x".into()).kind(), "UNSUPPORTED");
        assert_eq!(Error::InvArgument("x".into()).kind(), "INVALID_ARG");
        assert_eq!(Error::Config("x".into()).kind(), "INVALID_ARG");
        assert_eq!(Error::Conflict("x".into()).kind(), "CONFLICT");
        assert_eq!(Error::QueueFull.kind(), "QUEUE_FULL");
        assert_eq!(Error::Handler("x".into()).kind(), "HANDLER_ERROR");
        assert_eq!(Error::HandlerPanic("x".into()).kind(), "HANDLER_PANIC");
        assert_eq!(Error::Timeout.kind(), "TIMEOUT");
        assert_eq!(Error::Cancelled.kind(), "CANCELLED");
        assert_eq!(Error::Internal("x".into()).kind(), "INTERNAL");
    }

    #[test]
    fn test_channel_conversions() {
        let (tx, rx) = mpsc::channel::<u32>(1);

        tx.try_send(1).unwrap();
        assert_eq!(Error::from(tx.try_send(2).unwrap_err()), Error::QueueFull);

        drop(rx);
        assert_eq!(
            Error::from(tx.try_send(3).unwrap_err()),
            Error::Internal(String::from("request channel is closed"))
        );
    }
}
