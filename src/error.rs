use thiserror::Error;

use crate::config::ConfigError;
use crate::dcp::{DcpError, TaskPoolError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (backpressure, transient contention).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// What we know about side effects when an error is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Effect {
    /// Definitely no side effects occurred.
    None,
    /// Side effects definitely occurred (message buffered, stream killed).
    Some,
    /// We don't know if side effects occurred.
    Unknown,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::Some => "some",
            Effect::Unknown => "unknown",
        }
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Dcp(#[from] DcpError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TaskPool(#[from] TaskPoolError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Dcp(e) => e.transience(),
            Error::Config(_) => Transience::Permanent,
            Error::TaskPool(_) => Transience::Unknown,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            Error::Dcp(e) => e.effect(),
            Error::Config(_) => Effect::None,
            Error::TaskPool(_) => Effect::None,
        }
    }
}
