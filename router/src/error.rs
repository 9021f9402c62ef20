use thiserror::Error;

/// Failure classes for routing requests.
///
/// `Config` aborts setup; `NotFound` is the ordinary no-path outcome;
/// `Unavailable` marks transient collisions with concurrently reserved
/// resources and is the only class the route manager retries. Internal
/// consistency faults are not represented here: a graph that has diverged
/// from a valid state panics instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no route found: {0}")]
    NotFound(String),
    #[error("resource unavailable: {0}")]
    Unavailable(String),
}

impl RouterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RouterError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
