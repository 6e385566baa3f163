//! Replay queue and permanent store.
//!
//! Two levels of materialization: a bounded queue of the most recent
//! blocks absorbs reorgs in O(1), and a durable backend database holds
//! everything below the queue window. A reorg reaching below the window
//! deletes the permanent file and replays the new longest chain from
//! genesis.

use std::collections::VecDeque;
use std::path::PathBuf;

use catena_db::{Database, SqliteDatabase};
use catena_engine::Metadata;
use tracing::{info, warn};

use crate::apply::apply_block;
use crate::block::Block;
use crate::chain::Chain;
use crate::ledger::LedgerDelegate;
use crate::{ChainError, Result};

/// Most recent blocks held outside the permanent store.
pub const MAX_QUEUE_SIZE: usize = 7;

/// Where a permanent store lives.
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

/// The durable backend database reflecting applied blocks.
pub struct PermanentStore {
    location: StoreLocation,
    db: SqliteDatabase,
    difficulty: u32,
    replay: bool,
}

impl PermanentStore {
    /// Open (or create) the store and install the metadata tables.
    pub fn open(location: StoreLocation, difficulty: u32, replay: bool) -> Result<Self> {
        let db = Self::connect(&location)?;
        Metadata::new(&db).install()?;
        Ok(Self {
            location,
            db,
            difficulty,
            replay,
        })
    }

    fn connect(location: &StoreLocation) -> Result<SqliteDatabase> {
        Ok(match location {
            StoreLocation::File(path) => SqliteDatabase::open(path)?,
            StoreLocation::Memory => SqliteDatabase::open_memory()?,
        })
    }

    /// The backend holding the materialized state.
    pub fn database(&self) -> &dyn Database {
        &self.db
    }

    /// Index of the last applied block.
    pub fn head_index(&self) -> Result<Option<u64>> {
        Ok(Metadata::new(&self.db).head()?.map(|(index, _)| index))
    }

    /// Apply one block.
    pub fn apply(&self, block: &Block) -> Result<()> {
        apply_block(block, &self.db, self.difficulty, self.replay)
    }

    /// Discard the store and start over empty.
    pub fn reset(&mut self) -> Result<()> {
        match &self.location {
            StoreLocation::File(path) => {
                // Swap the live connection out before unlinking the file.
                let placeholder = SqliteDatabase::open_memory()?;
                drop(std::mem::replace(&mut self.db, placeholder));
                for suffix in ["", "-wal", "-shm"] {
                    let mut target = path.clone().into_os_string();
                    target.push(suffix);
                    let target = PathBuf::from(target);
                    if target.exists() {
                        std::fs::remove_file(&target).map_err(|e| {
                            ChainError::Format(format!(
                                "cannot remove {}: {e}",
                                target.display()
                            ))
                        })?;
                    }
                }
                self.db = SqliteDatabase::open(path)?;
            }
            StoreLocation::Memory => {
                self.db = SqliteDatabase::open_memory()?;
            }
        }
        Metadata::new(&self.db).install()?;
        Ok(())
    }
}

/// Bounded queue of recent blocks in front of a [`PermanentStore`].
pub struct ReplayQueue {
    queue: VecDeque<Block>,
    store: PermanentStore,
}

impl ReplayQueue {
    pub fn new(store: PermanentStore) -> Self {
        Self {
            queue: VecDeque::with_capacity(MAX_QUEUE_SIZE + 1),
            store,
        }
    }

    pub fn store(&self) -> &PermanentStore {
        &self.store
    }

    /// Number of blocks currently queued.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Rebuild the permanent store from genesis up to and including
    /// `to_index` on the given chain.
    fn replay_from_genesis(&mut self, chain: &Chain, to_index: u64) -> Result<()> {
        warn!(to_index, "replaying permanent store from genesis");
        self.store.reset()?;
        for block in chain.blocks_from(0) {
            if block.index > to_index {
                break;
            }
            self.store.apply(block)?;
        }
        Ok(())
    }
}

impl LedgerDelegate for ReplayQueue {
    fn did_append(&mut self, block: &Block, chain: &Chain) -> Result<()> {
        self.queue.push_back(block.clone());
        if self.queue.len() <= MAX_QUEUE_SIZE {
            return Ok(());
        }
        let promoted = self.queue.pop_front().expect("queue is nonempty");
        let expected = self.store.head_index()?.map(|i| i + 1).unwrap_or(0);
        if promoted.index == expected {
            self.store.apply(&promoted)?;
        } else {
            // The queue front no longer follows the permanent head; a
            // rewind happened while the queue was full. Rebuild through
            // the promoted block.
            self.replay_from_genesis(chain, promoted.index)?;
        }
        Ok(())
    }

    fn did_unwind(&mut self, from: &Block, to: &Block, chain: &Chain) -> Result<()> {
        info!(from = from.index, to = to.index, "unwinding");
        let store_head = self.store.head_index()?;
        let within_window = store_head.map(|h| h <= to.index).unwrap_or(true);
        if within_window {
            self.queue.retain(|b| b.index <= to.index);
        } else {
            self.replay_from_genesis(chain, to.index)?;
            self.queue.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::pow;
    use catena_crypto::Hash;

    fn mined_genesis() -> Block {
        let mut block = Block::genesis("g", Hash::of(b"m"), 0);
        pow::mine(&mut block, 0, &Default::default());
        block
    }

    fn mined_next(previous: &Block, timestamp: u64) -> Block {
        let mut block = Block::next(previous, Hash::of(b"m"), timestamp, vec![]);
        pow::mine(&mut block, 0, &Default::default());
        block
    }

    fn test_queue() -> ReplayQueue {
        let store = PermanentStore::open(StoreLocation::Memory, 0, true).expect("store");
        ReplayQueue::new(store)
    }

    #[test]
    fn test_queue_absorbs_up_to_bound() {
        let genesis = mined_genesis();
        let mut ledger = Ledger::with_difficulty(genesis.clone(), 0).expect("ledger");
        let mut queue = test_queue();
        ledger.synchronize(&mut queue).expect("synchronize");

        let mut head = genesis;
        for i in 1..=MAX_QUEUE_SIZE as u64 - 1 {
            head = mined_next(&head, i);
            ledger.receive(head.clone(), &mut queue).expect("receive");
        }
        assert_eq!(queue.queued(), MAX_QUEUE_SIZE);
        // Nothing promoted yet.
        assert_eq!(queue.store().head_index().expect("head"), None);
    }

    #[test]
    fn test_overflow_promotes_to_store() {
        let genesis = mined_genesis();
        let mut ledger = Ledger::with_difficulty(genesis.clone(), 0).expect("ledger");
        let mut queue = test_queue();
        ledger.synchronize(&mut queue).expect("synchronize");

        let mut head = genesis;
        for i in 1..=MAX_QUEUE_SIZE as u64 + 1 {
            head = mined_next(&head, i);
            ledger.receive(head.clone(), &mut queue).expect("receive");
        }
        assert_eq!(queue.queued(), MAX_QUEUE_SIZE);
        // Genesis and block 1 were promoted.
        assert_eq!(queue.store().head_index().expect("head"), Some(1));
    }

    #[test]
    fn test_reorg_within_window_truncates_queue_only() {
        let genesis = mined_genesis();
        let mut ledger = Ledger::with_difficulty(genesis.clone(), 0).expect("ledger");
        let mut queue = test_queue();
        ledger.synchronize(&mut queue).expect("synchronize");

        let b1 = mined_next(&genesis, 1);
        let b2 = mined_next(&b1, 2);
        ledger.receive(b1.clone(), &mut queue).expect("receive");
        ledger.receive(b2, &mut queue).expect("receive");
        assert_eq!(queue.queued(), 3);

        // Rival branch from b1 grows taller; the store was never touched.
        let r2 = mined_next(&b1, 60);
        let r3 = mined_next(&r2, 61);
        ledger.receive(r2, &mut queue).expect("receive");
        ledger.receive(r3, &mut queue).expect("receive");

        assert_eq!(queue.store().head_index().expect("head"), None);
        // genesis, b1, r2, r3
        assert_eq!(queue.queued(), 4);
    }

    #[test]
    fn test_reorg_below_window_replays_store() {
        let genesis = mined_genesis();
        let mut ledger = Ledger::with_difficulty(genesis.clone(), 0).expect("ledger");
        let mut queue = test_queue();
        ledger.synchronize(&mut queue).expect("synchronize");

        // Grow to index 8 so genesis and block 1 land in the store.
        let mut head = genesis.clone();
        for i in 1..=(MAX_QUEUE_SIZE as u64 + 1) {
            head = mined_next(&head, i);
            ledger.receive(head.clone(), &mut queue).expect("receive");
        }
        assert_eq!(queue.store().head_index().expect("head"), Some(1));

        // A rival chain branching at genesis that outgrows chain A. The
        // common ancestor (index 0) sits below the permanent head, so the
        // store is rebuilt from genesis.
        let mut rival_head = genesis;
        let mut rivals = Vec::new();
        for i in 1..=(MAX_QUEUE_SIZE as u64 + 3) {
            rival_head = mined_next(&rival_head, 100 + i);
            rivals.push(rival_head.clone());
        }
        for rival in rivals {
            ledger.receive(rival, &mut queue).expect("receive");
        }

        assert_eq!(ledger.longest().height(), MAX_QUEUE_SIZE as u64 + 3);
        // Post-replay, the store follows the new chain consecutively.
        let head_index = queue.store().head_index().expect("head").expect("present");
        assert_eq!(
            head_index,
            ledger.longest().height() - MAX_QUEUE_SIZE as u64
        );
        assert_eq!(queue.queued(), MAX_QUEUE_SIZE);
    }
}
