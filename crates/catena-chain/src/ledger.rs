//! The ledger: chain set, orphan pool, and longest-chain fork choice.
//!
//! `receive` validates a block, then extends a chain, branches one, or
//! parks the block as an orphan. After any successful insert the orphan
//! pool is drained and fork choice re-evaluated; chain splices are
//! reported to the delegate as an unwind followed by appends, in order.

use std::collections::HashMap;

use catena_crypto::Hash;
use tracing::{debug, info};

use crate::block::Block;
use crate::chain::Chain;
use crate::pow::INITIAL_DIFFICULTY;
use crate::{ChainError, Result};

/// Observer of the materialized longest chain.
///
/// `did_unwind(from, to)` reports that the blocks above `to` (the common
/// ancestor, on the new chain) are no longer part of the longest chain;
/// `did_append` follows for each new block in index order.
pub trait LedgerDelegate {
    fn did_append(&mut self, block: &Block, chain: &Chain) -> Result<()>;
    fn did_unwind(&mut self, from: &Block, to: &Block, chain: &Chain) -> Result<()>;
}

/// A delegate that ignores every event.
pub struct NullDelegate;

impl LedgerDelegate for NullDelegate {
    fn did_append(&mut self, _block: &Block, _chain: &Chain) -> Result<()> {
        Ok(())
    }

    fn did_unwind(&mut self, _from: &Block, _to: &Block, _chain: &Chain) -> Result<()> {
        Ok(())
    }
}

/// What happened to a received block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Extended the head of an existing chain.
    Extended,
    /// Started a new chain branching off an existing one.
    Branched,
    /// Parked as an orphan; the predecessor should be fetched.
    Orphaned { missing: Hash },
    /// Already known.
    Duplicate,
}

/// The ledger.
pub struct Ledger {
    chains: Vec<Chain>,
    longest: usize,
    /// Head index already reported to the delegate; `None` until the
    /// first synchronize call reports the genesis block.
    announced: Option<u64>,
    orphans: HashMap<Hash, Block>,
    orphans_by_previous: HashMap<Hash, Vec<Hash>>,
    difficulty: u32,
}

impl Ledger {
    /// Create a ledger rooted at a mined genesis block.
    pub fn new(genesis: Block) -> Result<Self> {
        Self::with_difficulty(genesis, INITIAL_DIFFICULTY)
    }

    pub fn with_difficulty(genesis: Block, difficulty: u32) -> Result<Self> {
        genesis.validate(difficulty)?;
        Ok(Self {
            chains: vec![Chain::new(genesis)?],
            longest: 0,
            announced: None,
            orphans: HashMap::new(),
            orphans_by_previous: HashMap::new(),
            difficulty,
        })
    }

    /// The current longest chain.
    pub fn longest(&self) -> &Chain {
        &self.chains[self.longest]
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Look a block up across all chains.
    pub fn get_block(&self, hash: &Hash) -> Option<&Block> {
        self.chains.iter().find_map(|c| c.get(hash))
    }

    /// Whether a hash is known as a block or an orphan.
    pub fn knows(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash) || self.get_block(hash).is_some()
    }

    /// Report any not-yet-announced longest-chain blocks to the delegate.
    /// Call once after construction so the genesis block materializes.
    pub fn synchronize(&mut self, delegate: &mut dyn LedgerDelegate) -> Result<()> {
        self.update_longest(delegate)
    }

    /// Validate and place a received block.
    pub fn receive(
        &mut self,
        block: Block,
        delegate: &mut dyn LedgerDelegate,
    ) -> Result<ReceiveOutcome> {
        block.validate(self.difficulty)?;

        if self.knows(&block.signature) {
            return Ok(ReceiveOutcome::Duplicate);
        }

        let outcome = match self.integrate(block.clone()) {
            Some(outcome) => {
                self.update_longest(delegate)?;
                self.drain_orphans(delegate)?;
                outcome
            }
            None => {
                let missing = block.previous;
                debug!(block = %block.signature, %missing, "block parked as orphan");
                self.orphans_by_previous
                    .entry(missing)
                    .or_default()
                    .push(block.signature);
                self.orphans.insert(block.signature, block);
                ReceiveOutcome::Orphaned { missing }
            }
        };
        Ok(outcome)
    }

    /// Try to place a block on some chain. Returns `None` when no chain
    /// knows its predecessor.
    fn integrate(&mut self, block: Block) -> Option<ReceiveOutcome> {
        for chain in &mut self.chains {
            if chain.highest().signature == block.previous {
                chain.extend(block).ok()?;
                return Some(ReceiveOutcome::Extended);
            }
        }
        for i in 0..self.chains.len() {
            if self.chains[i].contains(&block.previous) {
                let branch = self.chains[i].branch(block)?;
                self.chains.push(branch);
                return Some(ReceiveOutcome::Branched);
            }
        }
        None
    }

    /// Re-process orphans whose predecessor became known.
    fn drain_orphans(&mut self, delegate: &mut dyn LedgerDelegate) -> Result<()> {
        loop {
            let ready: Vec<Hash> = self
                .orphans
                .values()
                .filter(|b| self.get_block(&b.previous).is_some())
                .map(|b| b.signature)
                .collect();
            if ready.is_empty() {
                return Ok(());
            }
            for hash in ready {
                let block = match self.orphans.remove(&hash) {
                    Some(block) => block,
                    None => continue,
                };
                if let Some(siblings) = self.orphans_by_previous.get_mut(&block.previous) {
                    siblings.retain(|h| *h != hash);
                    if siblings.is_empty() {
                        self.orphans_by_previous.remove(&block.previous);
                    }
                }
                if self.integrate(block).is_some() {
                    self.update_longest(delegate)?;
                }
            }
        }
    }

    /// Longest-chain selection, strictly by height; a tie keeps the
    /// incumbent. Emits splice events for whatever changed since the
    /// last announcement.
    fn update_longest(&mut self, delegate: &mut dyn LedgerDelegate) -> Result<()> {
        let mut best = self.longest;
        for (i, chain) in self.chains.iter().enumerate() {
            if chain.height() > self.chains[best].height() {
                best = i;
            }
        }

        if best == self.longest {
            let next = match self.announced {
                Some(index) => index + 1,
                None => 0,
            };
            let chain = &self.chains[best];
            for block in chain.blocks_from(next) {
                delegate.did_append(block, chain)?;
            }
            self.announced = Some(chain.height());
            return Ok(());
        }

        let old = &self.chains[self.longest];
        let new = &self.chains[best];
        let ancestor = old
            .common_ancestor(new)
            .ok_or(ChainError::Inconsecutive)?;
        let from = old.highest().clone();
        let to = new
            .at_index(ancestor)
            .ok_or(ChainError::Inconsecutive)?
            .clone();
        info!(
            from_height = from.index,
            to_height = new.height(),
            ancestor, "longest chain changed"
        );
        delegate.did_unwind(&from, &to, new)?;
        for block in new.blocks_from(ancestor + 1) {
            delegate.did_append(block, new)?;
        }
        self.longest = best;
        self.announced = Some(self.chains[best].height());
        Ok(())
    }
}
