use std::fmt;

use thiserror::Error;

use crate::resource::ResourceState;

/// Failures originating in the cache machinery itself, as opposed to the producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The cache was disposed and no longer accepts operations.
    #[error("cache disposed")]
    Disposed,
    /// A fetch was started on a resource without a producer and without a previous value
    /// to pass through.
    #[error("no producer configured and no previous value to pass through")]
    MissingProducer,
    /// The requested state change is not part of the resource state machine.
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: ResourceState,
        to: ResourceState,
    },
    /// The fetch was replaced by a newer one, or the resource was invalidated while
    /// the fetch was in flight.
    #[error("fetch superseded by a newer generation")]
    Superseded,
    /// The resource was torn down while an observation was waiting for it.
    #[error("observation interrupted before the resource settled")]
    Interrupted,
}

/// The outcome of a failed observation.
///
/// Either the producer failed (after exhausting its retry budget), or the cache machinery
/// could not deliver a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveError<E> {
    /// The producer failed with this payload.
    Producer(E),
    /// The cache could not complete the observation.
    Cache(CacheError),
}

impl<E> ObserveError<E> {
    /// Returns the producer failure, if this is one.
    pub fn producer(&self) -> Option<&E> {
        match self {
            ObserveError::Producer(e) => Some(e),
            ObserveError::Cache(_) => None,
        }
    }
}

impl<E> From<CacheError> for ObserveError<E> {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl<E: fmt::Display> fmt::Display for ObserveError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObserveError::Producer(e) => write!(f, "producer failed: {e}"),
            ObserveError::Cache(e) => e.fmt(f),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for ObserveError<E> {}
