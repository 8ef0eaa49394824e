//! Typed errors surfaced by the persistence engine and the id allocator.
//!
//! Backend traits speak `anyhow`; these types are what callers of the engine
//! and the sequence manager match on. "Not found" is never an error: reads
//! return `Ok(None)` for absent items and reserve [`PersistenceError`] for a
//! backend that could not answer.

use aerie_core::IdType;

/// Failure of a pub-sub persistence operation.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The storage backend failed (I/O, connection, encoding).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Failure to issue a unique id.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    /// No id block could be checked out within the retry budget.
    #[error("failed to obtain an id block for type {id_type} after {attempts} attempts")]
    Exhausted {
        /// Sequence that could not be advanced.
        id_type: IdType,
        /// Number of attempts made.
        attempts: u32,
    },
    /// A block size of zero was requested.
    #[error("block size for id type {id_type} must be at least 1")]
    InvalidBlockSize {
        /// Sequence the size was requested for.
        id_type: IdType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_keeps_the_cause_message() {
        let err = PersistenceError::from(anyhow::anyhow!("connection refused"));
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn exhausted_names_type_and_attempts() {
        let err = SequenceError::Exhausted {
            id_type: IdType::ROSTER,
            attempts: 5,
        };
        assert_eq!(
            err.to_string(),
            "failed to obtain an id block for type 18 after 5 attempts"
        );
    }
}
