//! Main Crate Error

use std::fmt;

use crate::peer::PeerId;

#[derive(thiserror::Error, Debug)]
/// Chooserbench crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error], spawning worker threads can fail.
    IO(#[from] std::io::Error),

    /// A [crate::Config] failed validation.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Registering a strategy or membership constructor with an empty name.
    #[error("Unable to register {kind} constructor, name is empty")]
    EmptyName { kind: &'static str },

    /// Registering a strategy or membership constructor under a name that is taken.
    #[error("{kind} constructor for {name:?} already exists")]
    DuplicateRegistration { kind: &'static str, name: String },

    /// A client group refers to a strategy that was never registered.
    #[error("Strategy {0:?} is not supported")]
    UnknownStrategy(String),

    /// A client group refers to a membership policy that was never registered.
    #[error("Membership {0:?} is not supported")]
    UnknownMembership(String),

    /// A percentile latency profile that is not monotonically non-decreasing.
    #[error("Latency profile inconsistent p50: {p50:?}, p90: {p90:?}, p99: {p99:?}, p100: {p100:?}")]
    LatencyOrder {
        p50: std::time::Duration,
        p90: std::time::Duration,
        p99: std::time::Duration,
        p100: std::time::Duration,
    },

    /// A [crate::strategy::PeerList] rejected a membership update.
    #[error("Membership update rejected: {0}")]
    Membership(String),

    /// A participant of a [crate::signal::CompletionBarrier] went away without acknowledging.
    #[error("Barrier broken, {arrived} of {expected} participants acknowledged")]
    BarrierBroken { arrived: usize, expected: usize },

    /// [crate::BenchmarkContext::run] can only drive the lifecycle once.
    #[error("Benchmark was already launched")]
    AlreadyLaunched,

    /// Several construction errors, combined.
    #[error("{}", DisplayList(.0))]
    Multiple(Vec<Error>),
}

impl Error {
    /// Combine a list of errors into one, returns `None` if the list is empty.
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }
}

struct DisplayList<'a>(&'a [Error]);

impl fmt::Display for DisplayList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors a [crate::strategy::PeerList] may return from `choose`.
pub enum ChooseError {
    /// The [crate::strategy::BoundChooser] was not started yet.
    #[error("Chooser was not started")]
    NotStarted,

    /// The peer list has no peers to choose from.
    #[error("No peer available")]
    NoPeers,

    /// Strategy specific failure.
    #[error("{0}")]
    Other(String),
}

#[derive(thiserror::Error, Debug)]
/// Why a single simulated request failed.
///
/// These are only ever counted and logged, they never abort a run.
pub enum RequestError {
    /// The chooser could not pick a peer.
    #[error(transparent)]
    Choose(#[from] ChooseError),

    /// The server stopped serving before it accepted or answered the request.
    #[error("Server {0} is gone")]
    ServerGone(PeerId),

    /// No response within the configured request timeout.
    #[error("Request to {0} timed out")]
    Timeout(PeerId),

    /// A response came back from a different server than the one chosen.
    #[error("Expected a response from {expected}, got one from {actual}")]
    Misrouted { expected: PeerId, actual: PeerId },
}
