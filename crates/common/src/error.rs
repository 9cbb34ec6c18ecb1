// Error taxonomy for the reverse-tunnel subsystem (spec.md §7).

use thiserror::Error;

/// The semantic error taxonomy shared by the Trust Evaluator, Site Registry,
/// Site, and Dispatcher. Names match spec.md §7; they are deliberately not
/// one-to-one with any particular SSH or I/O error type, since callers
/// (and tests) reason about these categories, not about wire-level detail.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad certificate type, invalid authority domain, etc.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// No such site, no live connection in a pool, no domain match.
    #[error("not found: {0}")]
    NotFound(String),

    /// Authentication failed (cert not trusted, domain spoofing attempt).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The remote agent reported it can't reach the dial target, or tunnel
    /// I/O failed outright.
    #[error("connection problem: {0}")]
    ConnectionProblem(String),

    /// Reserved for registry collisions (same domain registered twice under
    /// conflicting configuration).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// IO error bubbled up from the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        Error::AccessDenied(msg.into())
    }

    pub fn connection_problem(msg: impl Into<String>) -> Self {
        Error::ConnectionProblem(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
