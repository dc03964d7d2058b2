use thiserror::Error;

/// Error taxonomy of the scheduling engine.
///
/// `Configuration` and `NotRegistered` fail the calling request synchronously.
/// `Unreachable` and `Invariant` are soft failures: the dispatcher logs them
/// and proceeds with a best-effort placement.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown scheduling policy `{0}`")]
    Configuration(String),

    #[error("unregistered referent: {0}")]
    NotRegistered(String),

    #[error("peer `{0}` unreachable: {1}")]
    Unreachable(String, String),

    #[error("timeline invariant violated on processor {processor}: {detail}")]
    Invariant { processor: usize, detail: String },

    #[error("malformed task set: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
