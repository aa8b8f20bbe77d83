//! Error types for channel construction and membership convergence.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::transport::TransportError;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while assembling or operating a channel.
#[derive(Debug)]
pub enum Error {
    /// The stack configuration declares no transport.
    ///
    /// A protocol stack has no meaning without a bottom transport layer,
    /// so assembly refuses to proceed rather than producing a channel
    /// that cannot move bytes.
    MissingTransport,

    /// Two protocol configurations claim the same socket-binding name.
    DuplicateBinding {
        /// Name of the contested socket binding.
        name: String,
        /// Protocol layer that claimed the binding second.
        claimed_by: String,
    },

    /// A fork id was registered twice on the same physical channel.
    ///
    /// Multiplexing is one-to-one per physical channel; re-registering an
    /// id is always a deployment-ordering bug, never a recoverable race.
    DuplicateFork(String),

    /// Failed to decode an inbound frame.
    Decode(String),

    /// Transport-level failure (socket creation, bind, send path).
    Transport(TransportError),

    /// Internal stack wiring or queue failure.
    Channel(String),

    /// The channel has been closed.
    Shutdown,

    /// A membership convergence wait expired before the expected view
    /// was established.
    ConvergenceTimeout(Box<ConvergenceTimeout>),
}

/// Diagnostic payload of a convergence timeout.
///
/// Carries the best-known state at expiry so callers can decide whether
/// to retry with a fresh deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTimeout {
    /// The member set the caller was waiting for.
    pub expected: BTreeSet<String>,
    /// The member set last observed before the deadline.
    pub observed: BTreeSet<String>,
    /// Topology id of the last observed view.
    pub topology_id: u64,
    /// How long the caller waited.
    pub waited: Duration,
}

impl fmt::Display for ConvergenceTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to establish view {:?} within {} ms; current view is {:?} (topology id {})",
            self.expected,
            self.waited.as_millis(),
            self.observed,
            self.topology_id
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MissingTransport => {
                write!(f, "protocol stack configuration declares no transport")
            }
            Error::DuplicateBinding { name, claimed_by } => {
                write!(
                    f,
                    "socket binding {:?} is already claimed by another layer (duplicate claim from {:?})",
                    name, claimed_by
                )
            }
            Error::DuplicateFork(id) => {
                write!(f, "fork {:?} is already registered on this channel", id)
            }
            Error::Decode(msg) => {
                write!(f, "failed to decode message: {}", msg)
            }
            Error::Transport(err) => {
                write!(f, "transport error: {}", err)
            }
            Error::Channel(msg) => {
                write!(f, "channel error: {}", msg)
            }
            Error::Shutdown => {
                write!(f, "channel has been shut down")
            }
            Error::ConvergenceTimeout(timeout) => {
                write!(f, "{}", timeout)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err)
    }
}

impl Error {
    /// Returns the timeout diagnostics if this is a convergence timeout.
    pub fn as_convergence_timeout(&self) -> Option<&ConvergenceTimeout> {
        match self {
            Error::ConvergenceTimeout(timeout) => Some(timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convergence_timeout_display_reports_both_views() {
        let err = Error::ConvergenceTimeout(Box::new(ConvergenceTimeout {
            expected: ["a".to_owned(), "b".to_owned()].into_iter().collect(),
            observed: ["a".to_owned()].into_iter().collect(),
            topology_id: 7,
            waited: Duration::from_millis(2000),
        }));
        let rendered = err.to_string();
        assert!(rendered.contains("2000 ms"));
        assert!(rendered.contains("topology id 7"));
    }
}
