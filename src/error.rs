use std::time::Duration;

/// Errors surfaced by mutating operations on a [`HashTable`](crate::HashTable).
///
/// Every variant describes contention: the operation did not touch the map
/// and may simply be retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The bucket lock stayed busy past the configured lock timeout.
    #[error("bucket {index} stayed locked for {waited:?}")]
    LockTimeout { index: usize, waited: Duration },
    /// A resize (or clear) held the table past the configured lock timeout.
    #[error("table resize did not finish within {waited:?}")]
    ResizeTimeout { waited: Duration },
}

impl MapError {
    /// Whether retrying the failed call can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapError::LockTimeout { .. } | MapError::ResizeTimeout { .. } => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, MapError>;
