//! Per-type id sequences served from locally cached blocks.
//!
//! Each [`IdType`] has its own sequence with a block size. Ids are handed out
//! from the current block in memory; only when it runs dry does the manager
//! go to the [`UidProvider`] for the next one. Blocks lost to a crash are
//! never reissued, so ids are unique and increasing but may have gaps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aerie_core::{IdBlock, IdType};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::provider::UidProvider;
use crate::error::SequenceError;

/// Attempts made to check out a block before giving up.
pub const MAX_BLOCK_ATTEMPTS: u32 = 5;
/// Pause between attempts after contention or a backend error.
pub const CONTENTION_BACKOFF: Duration = Duration::from_millis(75);

const DEFAULT_BLOCK_SIZES: &[(IdType, u32)] = &[
    (IdType::ROSTER, 5),
    (IdType::OFFLINE, 1),
    (IdType::MUC_ROOM, 1),
];

#[derive(Default)]
struct Cursor {
    current: i64,
    max: i64,
}

struct Sequence {
    block_size: AtomicU32,
    cursor: Mutex<Cursor>,
}

impl Sequence {
    fn new(block_size: u32) -> Self {
        Self {
            block_size: AtomicU32::new(block_size),
            cursor: Mutex::new(Cursor::default()),
        }
    }
}

/// Issues unique ids per [`IdType`].
pub struct SequenceManager {
    provider: Arc<dyn UidProvider>,
    sequences: DashMap<IdType, Arc<Sequence>>,
    backoff: Duration,
}

impl SequenceManager {
    /// Creates a manager with the well-known types registered at their
    /// default block sizes. Other types start with a block size of 1.
    #[must_use]
    pub fn new(provider: Arc<dyn UidProvider>) -> Self {
        let sequences = DashMap::new();
        for &(id_type, block_size) in DEFAULT_BLOCK_SIZES {
            sequences.insert(id_type, Arc::new(Sequence::new(block_size)));
        }
        Self {
            provider,
            sequences,
            backoff: CONTENTION_BACKOFF,
        }
    }

    /// Overrides the pause between block checkout attempts.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets how many ids `id_type` checks out per backend round trip.
    ///
    /// Takes effect at the next block checkout.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::InvalidBlockSize`] if `block_size` is zero.
    pub fn set_block_size(&self, id_type: IdType, block_size: u32) -> Result<(), SequenceError> {
        if block_size == 0 {
            return Err(SequenceError::InvalidBlockSize { id_type });
        }
        self.sequence(id_type)
            .block_size
            .store(block_size, Ordering::Relaxed);
        debug!(%id_type, block_size, "id block size set");
        Ok(())
    }

    #[must_use]
    pub fn block_size(&self, id_type: IdType) -> u32 {
        self.sequences
            .get(&id_type)
            .map_or(1, |sequence| sequence.block_size.load(Ordering::Relaxed))
    }

    /// Returns the next unique id of `id_type`.
    ///
    /// Callers of the same type are serialized only while the cached block
    /// is refilled.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::Exhausted`] if no block could be checked out
    /// within [`MAX_BLOCK_ATTEMPTS`].
    pub async fn next_id(&self, id_type: IdType) -> Result<i64, SequenceError> {
        let sequence = self.sequence(id_type);
        let mut cursor = sequence.cursor.lock().await;
        if cursor.current >= cursor.max {
            let block_size = sequence.block_size.load(Ordering::Relaxed);
            let block = self.checkout_block(id_type, block_size).await?;
            cursor.current = block.start;
            cursor.max = block.end;
        }
        let id = cursor.current;
        cursor.current += 1;
        Ok(id)
    }

    fn sequence(&self, id_type: IdType) -> Arc<Sequence> {
        Arc::clone(
            &self
                .sequences
                .entry(id_type)
                .or_insert_with(|| Arc::new(Sequence::new(1))),
        )
    }

    async fn checkout_block(
        &self,
        id_type: IdType,
        block_size: u32,
    ) -> Result<IdBlock, SequenceError> {
        for attempt in 1..=MAX_BLOCK_ATTEMPTS {
            match self.provider.next_block(id_type, block_size).await {
                Ok(Some(block)) if !block.is_empty() => {
                    debug!(%id_type, start = block.start, end = block.end, "checked out id block");
                    return Ok(block);
                }
                Ok(Some(block)) => {
                    warn!(
                        %id_type,
                        start = block.start,
                        end = block.end,
                        "backend returned an empty id block"
                    );
                }
                Ok(None) => {
                    debug!(%id_type, attempt, "id block contention, retrying");
                }
                Err(e) => {
                    warn!(%id_type, attempt, error = %e, "failed to check out id block");
                }
            }
            if attempt < MAX_BLOCK_ATTEMPTS {
                tokio::time::sleep(self.backoff).await;
            }
        }
        error!(%id_type, attempts = MAX_BLOCK_ATTEMPTS, "giving up on id block checkout");
        Err(SequenceError::Exhausted {
            id_type,
            attempts: MAX_BLOCK_ATTEMPTS,
        })
    }
}
